//! # Operator errors
//!
//! Errors raised by the collaborators the reconciler talks to. The reconciler
//! itself folds these into a unit status instead of returning them.

/// Errors produced by stores, workloads and configuration loading
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid HTTP request: {0}")]
    Request(#[from] http::Error),

    #[error("Stored value is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Pebble error: {0}")]
    Pebble(String),

    #[error("Workload container is not reachable: {0}")]
    WorkloadUnavailable(String),

    #[error("Workload rejected the pod spec: {0}")]
    Apply(String),

    #[error("Unknown trigger: {0}")]
    InvalidTrigger(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;
