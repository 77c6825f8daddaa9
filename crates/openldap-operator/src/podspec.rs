//! # Pod spec
//!
//! Wire model of the workload specification handed to the scheduler. Key
//! names are fixed by the consumer and serialized in camelCase.

use crate::config::CharmConfig;
use crate::state::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pod spec format version understood by the scheduler
pub const POD_SPEC_VERSION: u32 = 3;

/// Port the LDAP server listens on inside the container
pub const LDAP_PORT: u16 = 389;

/// Environment variable carrying the admin credential
pub const ADMIN_PASSWORD_ENV: &str = "LDAP_ADMIN_PASSWORD";

/// Complete workload specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub version: u32,
    pub containers: Vec<ContainerSpec>,
}

/// Single container of the workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image_details: ImageDetails,
    pub ports: Vec<PortSpec>,
    pub env_config: BTreeMap<String, String>,
    pub kubernetes: KubernetesSpec,
}

/// Image reference with optional registry credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    pub image_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Exposed container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    pub readiness_probe: Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub tcp_socket: TcpSocket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSocket {
    pub port: u16,
}

impl PodSpec {
    /// Assemble the spec from config, relation data and the admin password.
    ///
    /// The admin password variable is only present when `admin_password` is
    /// non-empty. Registry credentials are dropped when the username is empty.
    pub fn assemble(
        name: &str,
        config: &CharmConfig,
        database: &DatabaseConnection,
        admin_password: &str,
    ) -> Self {
        let mut env_config = database.env();
        if !admin_password.is_empty() {
            env_config.insert(ADMIN_PASSWORD_ENV.to_string(), admin_password.to_string());
        }

        let (username, password) = match config.image_credentials() {
            Some((username, password)) => (Some(username), Some(password)),
            None => (None, None),
        };

        let container = ContainerSpec {
            name: name.to_string(),
            image_details: ImageDetails {
                image_path: config.image_path.clone().unwrap_or_default(),
                username,
                password,
            },
            ports: vec![PortSpec {
                container_port: LDAP_PORT,
                protocol: "TCP".to_string(),
            }],
            env_config,
            kubernetes: KubernetesSpec {
                readiness_probe: Probe {
                    tcp_socket: TcpSocket {
                        port: config.container_port,
                    },
                },
            },
        };

        Self {
            version: POD_SPEC_VERSION,
            containers: vec![container],
        }
    }

    /// The workload container, the spec always carries exactly one
    pub fn container(&self) -> Option<&ContainerSpec> {
        self.containers.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn database() -> DatabaseConnection {
        DatabaseConnection {
            dbname: "openldap".to_string(),
            user: "ldap_user".to_string(),
            password: "ldap_password".to_string(),
            host: "1.1.1.1".to_string(),
            port: "5432".to_string(),
        }
    }

    fn config() -> CharmConfig {
        CharmConfig {
            image_path: Some("example.com/openldap:latest".to_string()),
            image_username: Some(String::new()),
            image_password: Some(String::new()),
            admin_password: Some("badmin_password".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_spec_wire_format() {
        let spec = PodSpec::assemble("openldap", &config(), &database(), "badmin_password");
        let expected = json!({
            "version": 3,
            "containers": [{
                "name": "openldap",
                "imageDetails": {
                    "imagePath": "example.com/openldap:latest"
                },
                "ports": [{"containerPort": 389, "protocol": "TCP"}],
                "envConfig": {
                    "POSTGRES_NAME": "openldap",
                    "POSTGRES_USER": "ldap_user",
                    "POSTGRES_PASSWORD": "ldap_password",
                    "POSTGRES_HOST": "1.1.1.1",
                    "POSTGRES_PORT": "5432",
                    "LDAP_ADMIN_PASSWORD": "badmin_password"
                },
                "kubernetes": {
                    "readinessProbe": {"tcpSocket": {"port": 389}}
                }
            }]
        });

        assert_eq!(serde_json::to_value(&spec).unwrap(), expected);
    }

    #[test]
    fn test_image_credentials_attached() {
        let mut config = config();
        config.image_username = Some("puller".to_string());
        config.image_password = Some("pull-secret".to_string());

        let spec = PodSpec::assemble("openldap", &config, &database(), "");
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            value["containers"][0]["imageDetails"],
            json!({
                "imagePath": "example.com/openldap:latest",
                "username": "puller",
                "password": "pull-secret"
            })
        );
    }

    #[test]
    fn test_password_without_username_omitted() {
        let mut config = config();
        config.image_password = Some("orphan".to_string());

        let spec = PodSpec::assemble("openldap", &config, &database(), "");
        let details = &serde_json::to_value(&spec).unwrap()["containers"][0]["imageDetails"];
        assert!(details.get("username").is_none());
        assert!(details.get("password").is_none());
    }

    #[test]
    fn test_empty_admin_password_not_exported() {
        let spec = PodSpec::assemble("openldap", &config(), &database(), "");
        let container = spec.container().unwrap();
        assert!(!container.env_config.contains_key(ADMIN_PASSWORD_ENV));
        assert_eq!(container.env_config.len(), 5);
    }

    #[test]
    fn test_probe_follows_configured_port() {
        let mut config = config();
        config.container_port = 567;

        let spec = PodSpec::assemble("openldap", &config, &database(), "x");
        let container = spec.container().unwrap();
        assert_eq!(container.kubernetes.readiness_probe.tcp_socket.port, 567);
        assert_eq!(container.ports[0].container_port, LDAP_PORT);
    }
}
