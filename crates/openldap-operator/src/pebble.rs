//! # Pebble client
//!
//! Talks to the Pebble daemon of the workload container over its unix socket
//! using Pebble's JSON HTTP API.

use crate::error::{OperatorError, Result};
use crate::workload::{PebbleClient, PebbleLayer, PebbleService};
use async_trait::async_trait;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tracing::debug;

/// How long a restart may take before Pebble reports the change as failed
const CHANGE_WAIT_TIMEOUT: &str = "60s";

/// Envelope every Pebble endpoint answers with
#[derive(Debug, Clone, Deserialize)]
pub struct PebbleResponse {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "status-code", default)]
    pub status_code: u16,

    /// Change id of an async operation
    #[serde(default)]
    pub change: Option<String>,

    #[serde(default)]
    pub result: Value,
}

impl PebbleResponse {
    /// Decode a response body, turning error envelopes into errors
    pub fn parse(status: StatusCode, body: &[u8]) -> Result<Self> {
        let response: Self = serde_json::from_slice(body)?;
        if response.kind == "error" || !status.is_success() {
            let message = response
                .result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            return Err(OperatorError::Pebble(format!("{}: {}", status, message)));
        }
        Ok(response)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Plan {
    #[serde(default)]
    services: BTreeMap<String, PebbleService>,
}

/// Services of a plan as returned by `GET /v1/plan?format=yaml`
pub fn plan_services(result: &Value) -> Result<BTreeMap<String, PebbleService>> {
    let yaml = result
        .as_str()
        .ok_or_else(|| OperatorError::Pebble("plan is not a YAML document".to_string()))?;
    if yaml.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let plan: Plan = serde_yaml::from_str(yaml)?;
    Ok(plan.services)
}

/// Body of `POST /v1/layers`
pub fn add_layer_body(label: &str, layer: &PebbleLayer, combine: bool) -> Result<Value> {
    Ok(json!({
        "action": "add",
        "label": label,
        "combine": combine,
        "format": "yaml",
        "layer": serde_yaml::to_string(layer)?,
    }))
}

/// Fails when a finished change carries an error
pub fn change_outcome(change: &Value) -> Result<()> {
    match change.get("err").and_then(Value::as_str) {
        Some(err) if !err.is_empty() => Err(OperatorError::Pebble(err.to_string())),
        _ => Ok(()),
    }
}

/// Pebble client bound to a unix socket path
#[derive(Debug, Clone)]
pub struct PebbleSocketClient {
    socket: PathBuf,
}

impl PebbleSocketClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<PebbleResponse> {
        let stream = UnixStream::connect(&self.socket).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Pebble connection closed: {}", e);
            }
        });

        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(value)?),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        debug!("Pebble {} -> {}", path, status);
        PebbleResponse::parse(status, &bytes)
    }
}

#[async_trait]
impl PebbleClient for PebbleSocketClient {
    async fn can_connect(&self) -> bool {
        match self.request(Method::GET, "/v1/system-info", None).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Pebble at {} not reachable: {}", self.socket.display(), e);
                false
            }
        }
    }

    async fn services(&self) -> Result<BTreeMap<String, PebbleService>> {
        let response = self.request(Method::GET, "/v1/plan?format=yaml", None).await?;
        plan_services(&response.result)
    }

    async fn add_layer(&self, label: &str, layer: &PebbleLayer, combine: bool) -> Result<()> {
        let body = add_layer_body(label, layer, combine)?;
        self.request(Method::POST, "/v1/layers", Some(&body)).await?;
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        let body = json!({ "action": "restart", "services": [service] });
        let response = self.request(Method::POST, "/v1/services", Some(&body)).await?;
        let change = response
            .change
            .ok_or_else(|| OperatorError::Pebble("restart returned no change id".to_string()))?;

        let path = format!("/v1/changes/{}/wait?timeout={}", change, CHANGE_WAIT_TIMEOUT);
        let finished = self.request(Method::GET, &path, None).await?;
        change_outcome(&finished.result)
    }
}
