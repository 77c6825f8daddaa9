//! # Workload collaborators
//!
//! Destinations for the assembled pod spec. The reconciler only sees the
//! `Workload` trait; each implementation decides how the spec reaches the
//! running container.

use crate::error::{OperatorError, Result};
use crate::podspec::PodSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Script the workload image runs to configure and start slapd
pub const OPENLDAP_COMMAND: &str = "/srv/image-scripts/configure-and-run-openldap.sh";

/// Result of a successful apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Applied,
    /// The workload already runs this spec
    Unchanged,
}

/// Receives the desired pod spec
#[async_trait]
pub trait Workload: Send + Sync {
    async fn apply(&self, spec: &PodSpec) -> Result<ApplyOutcome>;
}

/// Keeps applied specs in memory
#[derive(Debug, Default)]
pub struct MemoryWorkload {
    applied: Mutex<Vec<PodSpec>>,
}

impl MemoryWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spec applied so far
    pub fn applied(&self) -> Vec<PodSpec> {
        self.applied
            .lock()
            .map(|applied| applied.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<PodSpec> {
        self.applied().pop()
    }
}

#[async_trait]
impl Workload for MemoryWorkload {
    async fn apply(&self, spec: &PodSpec) -> Result<ApplyOutcome> {
        let mut applied = self
            .applied
            .lock()
            .map_err(|_| OperatorError::Apply("workload record poisoned".to_string()))?;
        let outcome = if applied.last() == Some(spec) {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Applied
        };
        applied.push(spec.clone());
        Ok(outcome)
    }
}

/// Writes the pod spec as JSON for an external scheduler to pick up
#[derive(Debug, Clone)]
pub struct FileWorkload {
    path: PathBuf,
}

impl FileWorkload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Workload for FileWorkload {
    async fn apply(&self, spec: &PodSpec) -> Result<ApplyOutcome> {
        let rendered = serde_json::to_vec_pretty(spec)?;
        match tokio::fs::read(&self.path).await {
            Ok(existing) if existing == rendered => {
                debug!("Pod spec at {} is up to date", self.path.display());
                return Ok(ApplyOutcome::Unchanged);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, rendered).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!("Wrote pod spec to {}", self.path.display());
        Ok(ApplyOutcome::Applied)
    }
}

/// Pebble configuration layer for the workload container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PebbleLayer {
    pub summary: String,
    pub description: String,
    pub services: BTreeMap<String, PebbleService>,
    pub checks: BTreeMap<String, PebbleCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PebbleService {
    #[serde(rename = "override")]
    pub override_: String,
    pub startup: String,
    pub command: String,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PebbleCheck {
    #[serde(rename = "override")]
    pub override_: String,
    pub level: String,
    pub tcp: TcpCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpCheck {
    pub port: u16,
}

impl PebbleLayer {
    /// Render the layer running the spec's container as a Pebble service
    pub fn from_pod_spec(spec: &PodSpec) -> Result<Self> {
        let container = spec
            .container()
            .ok_or_else(|| OperatorError::Apply("pod spec has no containers".to_string()))?;

        let service = PebbleService {
            override_: "replace".to_string(),
            startup: "enabled".to_string(),
            command: OPENLDAP_COMMAND.to_string(),
            environment: container.env_config.clone(),
        };
        let check = PebbleCheck {
            override_: "replace".to_string(),
            level: "ready".to_string(),
            tcp: TcpCheck {
                port: container.kubernetes.readiness_probe.tcp_socket.port,
            },
        };

        Ok(Self {
            summary: format!("{} layer", container.name),
            description: format!("pebble config layer for {}", container.name),
            services: BTreeMap::from([(container.name.clone(), service)]),
            checks: BTreeMap::from([("online".to_string(), check)]),
        })
    }
}

/// Connection to the Pebble daemon of the workload container
#[async_trait]
pub trait PebbleClient: Send + Sync {
    async fn can_connect(&self) -> bool;

    /// Services of the current plan
    async fn services(&self) -> Result<BTreeMap<String, PebbleService>>;

    async fn add_layer(&self, label: &str, layer: &PebbleLayer, combine: bool) -> Result<()>;

    async fn restart(&self, service: &str) -> Result<()>;
}

/// Applies the spec as a Pebble layer, restarting only when services change
pub struct PebbleWorkload<C> {
    client: C,
}

impl<C: PebbleClient> PebbleWorkload<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: PebbleClient> Workload for PebbleWorkload<C> {
    async fn apply(&self, spec: &PodSpec) -> Result<ApplyOutcome> {
        if !self.client.can_connect().await {
            return Err(OperatorError::WorkloadUnavailable(
                "pebble socket not ready".to_string(),
            ));
        }

        let layer = PebbleLayer::from_pod_spec(spec)?;
        if self.client.services().await? == layer.services {
            return Ok(ApplyOutcome::Unchanged);
        }

        for name in layer.services.keys() {
            self.client.add_layer(name, &layer, true).await?;
            self.client.restart(name).await?;
            info!("Restarted {} with updated layer", name);
        }
        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CharmConfig;
    use crate::state::DatabaseConnection;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakePebble {
        offline: AtomicBool,
        services: Mutex<BTreeMap<String, PebbleService>>,
        restarts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PebbleClient for FakePebble {
        async fn can_connect(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }

        async fn services(&self) -> Result<BTreeMap<String, PebbleService>> {
            Ok(self.services.lock().unwrap().clone())
        }

        async fn add_layer(&self, _label: &str, layer: &PebbleLayer, _combine: bool) -> Result<()> {
            self.services.lock().unwrap().extend(layer.services.clone());
            Ok(())
        }

        async fn restart(&self, service: &str) -> Result<()> {
            self.restarts.lock().unwrap().push(service.to_string());
            Ok(())
        }
    }

    fn spec(port: u16) -> PodSpec {
        let config = CharmConfig {
            image_path: Some("example.com/openldap:latest".to_string()),
            container_port: port,
            ..Default::default()
        };
        let db = DatabaseConnection {
            dbname: "openldap".to_string(),
            user: "ldap_user".to_string(),
            password: "ldap_password".to_string(),
            host: "1.1.1.1".to_string(),
            port: "5432".to_string(),
        };
        PodSpec::assemble("openldap", &config, &db, "badmin_password")
    }

    #[test]
    fn test_pebble_layer_render() {
        let layer = PebbleLayer::from_pod_spec(&spec(389)).unwrap();
        let value = serde_json::to_value(&layer).unwrap();

        assert_eq!(value["summary"], "openldap layer");
        assert_eq!(value["description"], "pebble config layer for openldap");
        assert_eq!(value["services"]["openldap"]["override"], "replace");
        assert_eq!(value["services"]["openldap"]["command"], OPENLDAP_COMMAND);
        assert_eq!(
            value["services"]["openldap"]["environment"]["LDAP_ADMIN_PASSWORD"],
            "badmin_password"
        );
        assert_eq!(value["checks"]["online"]["level"], "ready");
        assert_eq!(value["checks"]["online"]["tcp"]["port"], 389);
    }

    #[tokio::test]
    async fn test_pebble_restarts_only_on_change() {
        let workload = PebbleWorkload::new(FakePebble::default());

        assert_eq!(workload.apply(&spec(389)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(workload.apply(&spec(389)).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(workload.client().restarts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pebble_unavailable() {
        let pebble = FakePebble::default();
        pebble.offline.store(true, Ordering::SeqCst);
        let workload = PebbleWorkload::new(pebble);

        let err = workload.apply(&spec(389)).await.unwrap_err();
        assert!(matches!(err, OperatorError::WorkloadUnavailable(_)));
    }

    #[tokio::test]
    async fn test_memory_workload_detects_repeat() {
        let workload = MemoryWorkload::new();
        assert_eq!(workload.apply(&spec(389)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(workload.apply(&spec(389)).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(workload.apply(&spec(567)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(workload.applied().len(), 3);
    }

    #[tokio::test]
    async fn test_file_workload_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podspec.json");
        let workload = FileWorkload::new(&path);

        assert_eq!(workload.apply(&spec(389)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(workload.apply(&spec(389)).await.unwrap(), ApplyOutcome::Unchanged);

        let written: PodSpec = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, spec(389));
        assert!(!path.with_extension("tmp").exists());

        assert_eq!(workload.apply(&spec(1389)).await.unwrap(), ApplyOutcome::Applied);
        let written: PodSpec = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, spec(1389));
        assert!(!path.with_extension("tmp").exists());
    }
}
