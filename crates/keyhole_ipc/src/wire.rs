//! Wire shapes for the IPC channel (§3, §4.6): what actually crosses the
//! socket as one JSON frame payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HEALTH_SERVICE: &str = "__health__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    Text,
    Base64,
}

impl Default for BodyEncoding {
    fn default() -> Self {
        BodyEncoding::Text
    }
}

/// One relayed agent call. `ott` rides along on every message since the
/// server authenticates each one independently (no session state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    pub ott: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub service: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
}

impl IpcRequest {
    pub fn is_health_check(&self) -> bool {
        self.service == HEALTH_SERVICE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether any masking layer rewrote this response (§3). Distinct from
    /// the audit log's `redacted` field: this one crosses the trust
    /// boundary so the agent-side interceptor can surface it to callers
    /// that care, e.g. for test fixtures asserting a response was touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted: Option<bool>,
}

impl IpcResponse {
    pub fn error(id: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            headers: BTreeMap::new(),
            body: None,
            body_encoding: BodyEncoding::Text,
            error: Some(message.into()),
            redacted: None,
        }
    }

    pub fn ok_text(id: impl Into<String>, status: u16, body: String) -> Self {
        Self {
            id: id.into(),
            status,
            headers: BTreeMap::new(),
            body: Some(body),
            body_encoding: BodyEncoding::Text,
            error: None,
            redacted: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarState {
    Ready,
    PendingUnlock,
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub state: SidecarState,
    pub uptime_secs: u64,
}

/// Build the `__health__` pseudo-service response (§4.6): 200 when ready,
/// 503 while waiting on `unlock`. Answered even with the secret store
/// locked, and without any OTT check.
pub fn health_response(id: &str, state: SidecarState, uptime_secs: u64) -> IpcResponse {
    let status = match state {
        SidecarState::Ready => 200,
        SidecarState::PendingUnlock => 503,
    };
    let body = HealthBody { state, uptime_secs };
    IpcResponse::ok_text(id, status, serde_json::to_string(&body).unwrap_or_default())
}
