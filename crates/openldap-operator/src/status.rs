//! # Unit status
//!
//! The status label is the only user-visible outcome of a reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Unit status reported to the operator's user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    Active,
    Waiting(String),
    Maintenance(String),
    Blocked(String),
}

impl UnitStatus {
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::Waiting(message.into())
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::Maintenance(message.into())
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::Blocked(message.into())
    }

    /// Status name without the message
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting(_) => "waiting",
            Self::Maintenance(_) => "maintenance",
            Self::Blocked(_) => "blocked",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Active => "",
            Self::Waiting(m) | Self::Maintenance(m) | Self::Blocked(m) => m,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            "" => write!(f, "{}", self.name()),
            message => write!(f, "{}: {}", self.name(), message),
        }
    }
}

/// A status change as observed by the reporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: UnitStatus,
    pub at: DateTime<Utc>,
}

/// Sink for unit status updates
pub trait StatusReporter: Send + Sync {
    fn set_status(&self, status: UnitStatus);

    fn current(&self) -> Option<UnitStatus>;
}

/// Reporter that keeps every transition in memory
#[derive(Debug, Default)]
pub struct StatusHistory {
    changes: Mutex<Vec<StatusChange>>,
}

impl StatusHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status set so far, oldest first
    pub fn transitions(&self) -> Vec<UnitStatus> {
        self.changes
            .lock()
            .map(|changes| changes.iter().map(|c| c.status.clone()).collect())
            .unwrap_or_default()
    }

    pub fn changes(&self) -> Vec<StatusChange> {
        self.changes
            .lock()
            .map(|changes| changes.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut changes) = self.changes.lock() {
            changes.clear();
        }
    }
}

impl StatusReporter for StatusHistory {
    fn set_status(&self, status: UnitStatus) {
        info!("Unit status: {}", status);
        if let Ok(mut changes) = self.changes.lock() {
            changes.push(StatusChange {
                status,
                at: Utc::now(),
            });
        }
    }

    fn current(&self) -> Option<UnitStatus> {
        self.changes
            .lock()
            .ok()
            .and_then(|changes| changes.last().map(|c| c.status.clone()))
    }
}
