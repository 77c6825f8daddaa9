//! # Triggers
//!
//! Everything the host runtime can deliver to the operator, plus the results
//! handlers hand back to it.

use crate::error::{OperatorError, Result};
use crate::state::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Failure message of the get-admin-password action
pub const ADMIN_PASSWORD_UNSET: &str =
    "LDAP admin password has not yet been set, please retry later.";

/// A lifecycle trigger delivered to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Trigger {
    Start,
    ConfigChanged,
    LeaderElected,
    Upgrade,
    DatabaseRelationJoined(RelationJoined),
    MasterChanged(MasterChanged),
    DatabaseRelationBroken,
    /// Emitted after a usable primary was recorded
    DbMasterAvailable,
    Action { name: ActionRequest },
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ConfigChanged => "config-changed",
            Self::LeaderElected => "leader-elected",
            Self::Upgrade => "upgrade-charm",
            Self::DatabaseRelationJoined(_) => "db-relation-joined",
            Self::MasterChanged(_) => "db-master-changed",
            Self::DatabaseRelationBroken => "db-relation-broken",
            Self::DbMasterAvailable => "db-master-available",
            Self::Action { .. } => "action",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of db-relation-joined
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationJoined {
    /// Database name currently requested on the relation
    #[serde(default)]
    pub database: Option<String>,
}

/// Payload of db-master-changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterChanged {
    /// Database the relation data refers to
    #[serde(default)]
    pub database: Option<String>,

    /// Current primary, `None` while no primary is available
    #[serde(default)]
    pub master: Option<DatabaseConnection>,
}

/// Actions a user can run against the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionRequest {
    GetAdminPassword,
}

impl ActionRequest {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "get-admin-password" => Ok(Self::GetAdminPassword),
            other => Err(OperatorError::InvalidTrigger(format!("action {}", other))),
        }
    }
}

/// Result of an action, mirrors the success/fail pair of the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ActionResult {
    Success { results: BTreeMap<String, String> },
    Failed { message: String },
}

/// Whether a trigger is finished or must be delivered again later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Done,
    Retry,
}

/// What a handler did with a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleOutcome {
    pub disposition: Disposition,

    /// Triggers to handle right after this one
    pub emitted: Vec<Trigger>,

    pub action: Option<ActionResult>,
}

impl HandleOutcome {
    pub fn done() -> Self {
        Self {
            disposition: Disposition::Done,
            emitted: Vec::new(),
            action: None,
        }
    }

    pub fn retry() -> Self {
        Self {
            disposition: Disposition::Retry,
            ..Self::done()
        }
    }

    pub fn emit(mut self, trigger: Trigger) -> Self {
        self.emitted.push(trigger);
        self
    }

    pub fn with_action(mut self, result: ActionResult) -> Self {
        self.action = Some(result);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_serialization() {
        let trigger = Trigger::MasterChanged(MasterChanged {
            database: Some("openldap".to_string()),
            master: None,
        });
        let json = serde_json::to_string(&trigger).unwrap();
        let back: Trigger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trigger);

        let value = serde_json::to_value(Trigger::ConfigChanged).unwrap();
        assert_eq!(value, serde_json::json!({"kind": "config-changed"}));
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(
            ActionRequest::parse("get-admin-password").unwrap(),
            ActionRequest::GetAdminPassword
        );
        assert!(ActionRequest::parse("reboot").is_err());
    }
}
