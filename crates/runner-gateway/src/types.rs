//! Wire types for the gateway API.

use runner_common::Receipt;
use serde::{Deserialize, Serialize};

/// Query parameters accepted by `GET /`. The payload travels base64
/// encoded in `data`; everything else mirrors the POST headers.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecQuery {
    pub agent_url: Option<String>,
    pub request_id: Option<String>,
    pub data: Option<String>,
    pub timeout_ms: Option<u64>,
    pub api_key: Option<String>,
}

/// Just the key, for the auth middleware. Requests may carry the key in a
/// header instead, so every field here is optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthQuery {
    pub api_key: Option<String>,
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    /// Status the agent itself returned, present only for agent-level
    /// failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_body: Option<String>,
}
