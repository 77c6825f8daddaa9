//! # Charm configuration
//!
//! Snapshot of the externally supplied settings. Optional keys are kept as
//! `Option<String>` so an absent key and an empty value stay distinguishable.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Default LDAP port, used for the readiness probe unless overridden
pub const DEFAULT_CONTAINER_PORT: u16 = 389;

/// Settings read on every reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmConfig {
    /// Container image reference
    #[serde(default)]
    pub image_path: Option<String>,

    /// Registry username, credentials are only attached when non-empty
    #[serde(default)]
    pub image_username: Option<String>,

    /// Registry password
    #[serde(default)]
    pub image_password: Option<String>,

    /// Explicit LDAP admin password, takes precedence over a generated one
    #[serde(default)]
    pub admin_password: Option<String>,

    /// Port probed by the readiness check
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            image_username: None,
            image_password: None,
            admin_password: None,
            container_port: DEFAULT_CONTAINER_PORT,
        }
    }
}

impl CharmConfig {
    /// Parse a YAML mapping of setting name to value
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(source)?)
    }

    /// Load the configuration file, a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(source) => Self::from_yaml_str(&source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// The configured admin password, if set to something non-empty
    pub fn admin_password(&self) -> Option<&str> {
        non_empty(&self.admin_password)
    }

    /// Registry credentials, only when the username is non-empty
    pub fn image_credentials(&self) -> Option<(String, String)> {
        non_empty(&self.image_username).map(|username| {
            (
                username.to_string(),
                self.image_password.clone().unwrap_or_default(),
            )
        })
    }

    /// Required settings that are absent or empty.
    ///
    /// The admin password is only checked against the configuration here; a
    /// previously generated credential satisfies it as well, which the caller
    /// decides through `admin_password_resolvable`.
    pub fn missing_settings(&self, admin_password_resolvable: bool) -> BTreeSet<&'static str> {
        let mut missing = BTreeSet::new();
        if non_empty(&self.image_path).is_none() {
            missing.insert("image_path");
        }
        if self.admin_password().is_none() && !admin_password_resolvable {
            missing.insert("admin_password");
        }
        missing
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
