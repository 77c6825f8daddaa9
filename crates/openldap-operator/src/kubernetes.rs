//! # Kubernetes collaborators
//!
//! Cluster-backed implementations of the leader-scoped store, leadership
//! check and workload apply.

use crate::error::{OperatorError, Result};
use crate::podspec::{ContainerSpec, PodSpec};
use crate::reconciler::Leadership;
use crate::state::StateStore;
use crate::workload::{ApplyOutcome, Workload};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec as K8sPodSpec, Probe, Secret, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

/// Registry used when an image reference carries no registry host
const DEFAULT_REGISTRY: &str = "https://index.docker.io/v1/";

/// Leader-scoped settings, admin password included, stored in an Opaque Secret
#[derive(Clone)]
pub struct SecretStore {
    api: Api<Secret>,
    name: String,
}

impl SecretStore {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

/// Decoded value of one key of a Secret
fn secret_entry(secret: Secret, key: &str) -> Result<Option<String>> {
    secret
        .data
        .and_then(|mut data| data.remove(key))
        .map(|ByteString(bytes)| String::from_utf8(bytes))
        .transpose()
        .map_err(OperatorError::from)
}

fn leader_secret(name: &str, key: &str, value: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    }
}

#[async_trait]
impl StateStore for SecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.api.get_opt(&self.name).await? {
            Some(secret) => secret_entry(secret, key),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.api.get_opt(&self.name).await?.is_some() {
            let patch = json!({ "stringData": { key: value } });
            self.api
                .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        } else {
            self.api
                .create(&PostParams::default(), &leader_secret(&self.name, key, value))
                .await?;
            info!("Created Secret {}", self.name);
        }
        debug!("Stored {} in Secret {}", key, self.name);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.api.get_opt(&self.name).await?.is_some() {
            let patch = json!({ "data": { key: null } });
            self.api
                .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }
}

/// Leadership decided by the holder of a coordination Lease
#[derive(Clone)]
pub struct LeaseLeadership {
    api: Api<Lease>,
    lease: String,
    identity: String,
}

impl LeaseLeadership {
    pub fn new(
        client: Client,
        namespace: &str,
        lease: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease: lease.into(),
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl Leadership for LeaseLeadership {
    async fn is_leader(&self) -> Result<bool> {
        let holder = self
            .api
            .get_opt(&self.lease)
            .await?
            .and_then(|lease| lease.spec)
            .and_then(|spec| spec.holder_identity);
        Ok(holder.as_deref() == Some(self.identity.as_str()))
    }
}

/// Applies the pod spec to the container of an existing StatefulSet
#[derive(Clone)]
pub struct StatefulSetWorkload {
    client: Client,
    namespace: String,
    name: String,
}

impl StatefulSetWorkload {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn registry_secret_name(&self) -> String {
        format!("{}-registry", self.name)
    }

    async fn apply_registry_secret(
        &self,
        image_path: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = self.registry_secret_name();

        let docker_config = json!({
            "auths": {
                registry_host(image_path): {
                    "username": username,
                    "password": password,
                }
            }
        });
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            string_data: Some(BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                serde_json::to_string(&docker_config)?,
            )])),
            ..Default::default()
        };

        apply_resource(&api, &name, secret).await
    }

    async fn remove_registry_secret(&self) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = self.registry_secret_name();
        if api.get_opt(&name).await?.is_some() {
            api.delete(&name, &DeleteParams::default()).await?;
            info!("Deleted registry Secret {}", name);
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for StatefulSetWorkload {
    async fn apply(&self, spec: &PodSpec) -> Result<ApplyOutcome> {
        let desired = spec
            .container()
            .ok_or_else(|| OperatorError::Apply("pod spec has no containers".to_string()))?;

        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let current = api.get_opt(&self.name).await?.ok_or_else(|| {
            OperatorError::WorkloadUnavailable(format!("statefulset {} not found", self.name))
        })?;

        let container = to_container(desired);
        let pull_secret = self.registry_secret_name();
        let template = current.spec.and_then(|s| s.template.spec);
        let pulls_registry = template
            .as_ref()
            .map(|t| references_pull_secret(t, &pull_secret))
            .unwrap_or(false);
        let running = template
            .and_then(|t| t.containers.into_iter().find(|c| c.name == desired.name));
        let credentials = desired
            .image_details
            .username
            .as_deref()
            .zip(desired.image_details.password.as_deref());

        let up_to_date = running.as_ref().map(|r| same_container(r, &container)) == Some(true);
        if credentials.is_none() && !pulls_registry && up_to_date {
            return Ok(ApplyOutcome::Unchanged);
        }

        let mut pod_spec = json!({ "containers": [container] });
        match credentials {
            Some((username, password)) => {
                self.apply_registry_secret(&desired.image_details.image_path, username, password)
                    .await?;
                pod_spec["imagePullSecrets"] = pull_secrets_patch(&pull_secret, true);
            }
            None => {
                if pulls_registry {
                    pod_spec["imagePullSecrets"] = pull_secrets_patch(&pull_secret, false);
                }
                self.remove_registry_secret().await?;
            }
        }

        let patch = json!({ "spec": { "template": { "spec": pod_spec } } });
        api.patch(&self.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        info!("Patched StatefulSet {}/{}", self.namespace, self.name);
        Ok(ApplyOutcome::Applied)
    }
}

fn references_pull_secret(template: &K8sPodSpec, name: &str) -> bool {
    template
        .image_pull_secrets
        .iter()
        .flatten()
        .any(|secret| secret.name.as_deref() == Some(name))
}

/// Strategic merge entry adding or deleting one `imagePullSecrets` reference
fn pull_secrets_patch(name: &str, keep: bool) -> serde_json::Value {
    if keep {
        json!([{ "name": name }])
    } else {
        json!([{ "name": name, "$patch": "delete" }])
    }
}

/// Kubernetes container for a pod spec container, env sorted by name
pub fn to_container(spec: &ContainerSpec) -> Container {
    Container {
        name: spec.name.clone(),
        image: Some(spec.image_details.image_path.clone()),
        ports: Some(
            spec.ports
                .iter()
                .map(|p| ContainerPort {
                    container_port: i32::from(p.container_port),
                    protocol: Some(p.protocol.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        env: Some(
            spec.env_config
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(
                    spec.kubernetes.readiness_probe.tcp_socket.port,
                )),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn probe_port(container: &Container) -> Option<&IntOrString> {
    container
        .readiness_probe
        .as_ref()
        .and_then(|p| p.tcp_socket.as_ref())
        .map(|t| &t.port)
}

// The API server fills in probe and port defaults, so only the fields we set
// are compared.
fn same_container(running: &Container, desired: &Container) -> bool {
    running.image == desired.image
        && running.env == desired.env
        && probe_port(running) == probe_port(desired)
}

/// Registry host of an image reference, as used in a docker config
pub fn registry_host(image_path: &str) -> String {
    match image_path.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            host.to_string()
        }
        _ => DEFAULT_REGISTRY.to_string(),
    }
}

/// Create the resource or replace the existing one
async fn apply_resource<K>(api: &Api<K>, name: &str, mut resource: K) -> Result<()>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    match api.get_opt(name).await? {
        Some(existing) => {
            resource.meta_mut().resource_version = existing.meta().resource_version.clone();
            api.replace(name, &PostParams::default(), &resource).await?;
            info!("Updated {} {}", std::any::type_name::<K>(), name);
        }
        None => {
            api.create(&PostParams::default(), &resource).await?;
            info!("Created {} {}", std::any::type_name::<K>(), name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CharmConfig;
    use crate::state::DatabaseConnection;

    fn pod_spec() -> PodSpec {
        let config = CharmConfig {
            image_path: Some("registry.example.com/openldap:2.4.50".to_string()),
            container_port: 1389,
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
    fn test_to_container() {
        let spec = pod_spec();
        let container = to_container(spec.container().unwrap());

        assert_eq!(container.name, "openldap");
        assert_eq!(container.image.as_deref(), Some("registry.example.com/openldap:2.4.50"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 389);

        let env = container.env.as_ref().unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(env.len(), 6);

        assert_eq!(probe_port(&container), Some(&IntOrString::Int(1389)));
    }

    #[test]
    fn test_same_container_ignores_server_defaults() {
        let desired = to_container(pod_spec().container().unwrap());
        let mut running = desired.clone();
        if let Some(probe) = running.readiness_probe.as_mut() {
            probe.period_seconds = Some(10);
            probe.timeout_seconds = Some(1);
        }
        assert!(same_container(&running, &desired));

        running.image = Some("registry.example.com/openldap:2.6".to_string());
        assert!(!same_container(&running, &desired));
    }

    #[test]
    fn test_pull_secret_reference() {
        use k8s_openapi::api::core::v1::LocalObjectReference;

        let mut template = K8sPodSpec::default();
        assert!(!references_pull_secret(&template, "openldap-registry"));

        template.image_pull_secrets = Some(vec![
            LocalObjectReference {
                name: Some("other".to_string()),
            },
            LocalObjectReference {
                name: Some("openldap-registry".to_string()),
            },
        ]);
        assert!(references_pull_secret(&template, "openldap-registry"));

        assert_eq!(
            pull_secrets_patch("openldap-registry", true),
            json!([{ "name": "openldap-registry" }])
        );
        assert_eq!(
            pull_secrets_patch("openldap-registry", false),
            json!([{ "name": "openldap-registry", "$patch": "delete" }])
        );
    }

    #[test]
    fn test_leader_secret_round_trip() {
        let secret = leader_secret("openldap-leader-settings", "admin_password", "s3cret");
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert!(secret.data.is_none());
        assert_eq!(
            secret.string_data.as_ref().unwrap()["admin_password"],
            "s3cret"
        );

        // The API server returns stringData folded into base64 data
        let stored = Secret {
            data: Some(BTreeMap::from([(
                "admin_password".to_string(),
                ByteString(b"s3cret".to_vec()),
            )])),
            ..Default::default()
        };
        assert_eq!(
            secret_entry(stored.clone(), "admin_password").unwrap().as_deref(),
            Some("s3cret")
        );
        assert_eq!(secret_entry(stored, "postgres").unwrap(), None);

        let garbled = Secret {
            data: Some(BTreeMap::from([(
                "admin_password".to_string(),
                ByteString(vec![0xff, 0xfe]),
            )])),
            ..Default::default()
        };
        assert!(secret_entry(garbled, "admin_password").is_err());
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("registry.example.com/openldap:2.4.50"), "registry.example.com");
        assert_eq!(registry_host("localhost:5000/openldap"), "localhost:5000");
        assert_eq!(registry_host("localhost/openldap"), "localhost");
        assert_eq!(registry_host("openldapcharmers/openldap:2.4.50"), DEFAULT_REGISTRY);
        assert_eq!(registry_host("openldap"), DEFAULT_REGISTRY);
    }
}
