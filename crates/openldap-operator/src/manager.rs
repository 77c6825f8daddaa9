//! # Operator manager
//!
//! Wires the reconciler to local or Kubernetes-backed collaborators and runs
//! one trigger per invocation.

use crate::config::CharmConfig;
use crate::controller::{DispatchReport, Dispatcher};
use crate::error::Result;
use crate::events::Trigger;
use crate::kubernetes::{LeaseLeadership, SecretStore, StatefulSetWorkload};
use crate::pebble::PebbleSocketClient;
use crate::podspec::PodSpec;
use crate::reconciler::{Leadership, RecordedRelation, Reconciler, StaticLeadership};
use crate::state::{FileStore, StateStore};
use crate::status::StatusHistory;
use crate::workload::{FileWorkload, PebbleWorkload, Workload};
use crate::WORKLOAD_NAME;
use kube::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where leader data, leadership and the workload live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Files under the state directory, leadership from the config flag
    Local,
    /// Secret, Lease and StatefulSet in the configured namespace
    Kubernetes,
    /// Local state, with the spec applied as a layer through the Pebble socket
    Pebble,
}

/// Operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub backend: Backend,
    pub state_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub spec_out: Option<PathBuf>,
    pub pebble_socket: PathBuf,
    pub app_name: String,
    pub unit_name: String,
    pub namespace: String,
    pub leader: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            state_dir: default_state_dir(),
            config_path: None,
            spec_out: None,
            pebble_socket: default_pebble_socket(WORKLOAD_NAME),
            app_name: WORKLOAD_NAME.to_string(),
            unit_name: format!("{}/0", WORKLOAD_NAME),
            namespace: "default".to_string(),
            leader: false,
        }
    }
}

/// `$HOME/.local/share/openldap-operator`, or a relative directory without a home
pub fn default_state_dir() -> PathBuf {
    home::home_dir()
        .map(|home| home.join(".local").join("share").join("openldap-operator"))
        .unwrap_or_else(|| PathBuf::from(".openldap-operator"))
}

/// Where the workload container's Pebble socket is mounted in the operator pod
pub fn default_pebble_socket(container: &str) -> PathBuf {
    PathBuf::from("/charm/containers")
        .join(container)
        .join("pebble.socket")
}

impl OperatorConfig {
    pub fn unit_state_path(&self) -> PathBuf {
        self.state_dir.join("unit-state.json")
    }

    pub fn leader_settings_path(&self) -> PathBuf {
        self.state_dir.join("leader-settings.json")
    }

    pub fn spec_path(&self) -> PathBuf {
        self.spec_out
            .clone()
            .unwrap_or_else(|| self.state_dir.join("podspec.json"))
    }
}

/// Outcome of a hook run, printed by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookReport {
    #[serde(flatten)]
    pub dispatch: DispatchReport,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_database: Option<String>,
}

/// Main operator manager
pub struct OperatorManager {
    config: OperatorConfig,
    dispatcher: Dispatcher,
    relation: Arc<RecordedRelation>,
}

impl OperatorManager {
    /// Create a new operator manager
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        let charm_config = match &config.config_path {
            Some(path) => CharmConfig::load(path).await?,
            None => CharmConfig::default(),
        };
        let unit_store: Arc<dyn StateStore> = Arc::new(FileStore::new(config.unit_state_path()));

        let leader_store: Arc<dyn StateStore>;
        let leadership: Arc<dyn Leadership>;
        let workload: Arc<dyn Workload>;
        match config.backend {
            Backend::Local => {
                leader_store = Arc::new(FileStore::new(config.leader_settings_path()));
                leadership = Arc::new(StaticLeadership::new(config.leader));
                workload = Arc::new(FileWorkload::new(config.spec_path()));
            }
            Backend::Pebble => {
                leader_store = Arc::new(FileStore::new(config.leader_settings_path()));
                leadership = Arc::new(StaticLeadership::new(config.leader));
                workload = Arc::new(PebbleWorkload::new(PebbleSocketClient::new(
                    config.pebble_socket.clone(),
                )));
            }
            Backend::Kubernetes => {
                let client = Client::try_default().await?;
                leader_store = Arc::new(SecretStore::new(
                    client.clone(),
                    &config.namespace,
                    format!("{}-leader-settings", config.app_name),
                ));
                leadership = Arc::new(LeaseLeadership::new(
                    client.clone(),
                    &config.namespace,
                    format!("{}-leader", config.app_name),
                    config.unit_name.clone(),
                ));
                workload = Arc::new(StatefulSetWorkload::new(
                    client,
                    config.namespace.clone(),
                    config.app_name.clone(),
                ));
            }
        }

        let relation = Arc::new(RecordedRelation::new());
        let reconciler = Reconciler::builder()
            .config(charm_config)
            .unit_store(unit_store)
            .leader_store(leader_store)
            .leadership(leadership)
            .relation(relation.clone())
            .workload(workload)
            .status(Arc::new(StatusHistory::new()))
            .build();

        Ok(Self {
            config,
            dispatcher: Dispatcher::new(Arc::new(reconciler)),
            relation,
        })
    }

    /// Deliver one trigger, re-delivering anything deferred before it
    pub async fn run_hook(&self, trigger: Trigger) -> HookReport {
        info!(
            "Running {} for unit {} ({:?} backend)",
            trigger, self.config.unit_name, self.config.backend
        );
        let dispatch = self.dispatcher.dispatch(trigger).await;
        HookReport {
            dispatch,
            requested_database: self.relation.requested(),
        }
    }

    /// The pod spec the current state would produce
    pub async fn render(&self) -> Option<PodSpec> {
        self.dispatcher.reconciler().render().await
    }

    /// Get operator configuration
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }
}

/// Operator builder for fluent configuration
pub struct OperatorBuilder {
    config: OperatorConfig,
}

impl OperatorBuilder {
    pub fn new() -> Self {
        Self {
            config: OperatorConfig::default(),
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_path = Some(path.into());
        self
    }

    pub fn spec_out(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.spec_out = Some(path.into());
        self
    }

    pub fn pebble_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pebble_socket = path.into();
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    pub fn unit_name(mut self, name: impl Into<String>) -> Self {
        self.config.unit_name = name.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn leader(mut self, leader: bool) -> Self {
        self.config.leader = leader;
        self
    }

    pub fn into_config(self) -> OperatorConfig {
        self.config
    }

    pub async fn build(self) -> Result<OperatorManager> {
        OperatorManager::new(self.config).await
    }
}

impl Default for OperatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::UnitStatus;

    #[test]
    fn test_operator_builder() {
        let config = OperatorBuilder::new()
            .state_dir("/tmp/openldap")
            .namespace("ldap")
            .unit_name("openldap/1")
            .leader(true)
            .into_config();

        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.namespace, "ldap");
        assert_eq!(config.unit_name, "openldap/1");
        assert!(config.leader);
        assert_eq!(config.spec_path(), PathBuf::from("/tmp/openldap/podspec.json"));
        assert_eq!(
            config.unit_state_path(),
            PathBuf::from("/tmp/openldap/unit-state.json")
        );
    }

    #[test]
    fn test_operator_config_default() {
        let config = OperatorConfig::default();
        assert_eq!(config.app_name, "openldap");
        assert_eq!(config.unit_name, "openldap/0");
        assert!(!config.leader);
        assert!(config.state_dir.ends_with("openldap-operator"));
    }

    #[tokio::test]
    async fn test_local_manager_waits_for_database() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OperatorBuilder::new()
            .state_dir(dir.path())
            .leader(true)
            .build()
            .await
            .unwrap();

        let report = manager.run_hook(Trigger::Start).await;
        assert_eq!(
            report.dispatch.status,
            Some(UnitStatus::waiting("Waiting for database relation"))
        );
        assert_eq!(report.dispatch.deferred, 1);
        assert!(manager.render().await.is_none());
    }

    #[tokio::test]
    async fn test_pebble_manager_waits_for_socket() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OperatorBuilder::new()
            .backend(Backend::Pebble)
            .state_dir(dir.path())
            .pebble_socket(dir.path().join("pebble.socket"))
            .leader(true)
            .build()
            .await
            .unwrap();
        manager
            .dispatcher
            .reconciler()
            .unit_state()
            .set_database(Some(&crate::state::DatabaseConnection {
                dbname: "openldap".to_string(),
                user: "ldap_user".to_string(),
                password: "ldap_password".to_string(),
                host: "1.1.1.1".to_string(),
                port: "5432".to_string(),
            }))
            .await
            .unwrap();
        manager
            .dispatcher
            .reconciler()
            .set_config(CharmConfig {
                image_path: Some("example.com/openldap:latest".to_string()),
                admin_password: Some("badmin_password".to_string()),
                ..Default::default()
            })
            .await;

        let report = manager.run_hook(Trigger::ConfigChanged).await;
        assert_eq!(
            report.dispatch.status,
            Some(UnitStatus::waiting("waiting for Pebble in workload container"))
        );
        assert_eq!(report.dispatch.deferred, 1);
    }

    #[test]
    fn test_default_pebble_socket() {
        assert_eq!(
            OperatorConfig::default().pebble_socket,
            PathBuf::from("/charm/containers/openldap/pebble.socket")
        );
    }
}
