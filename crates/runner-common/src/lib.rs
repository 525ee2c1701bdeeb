// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the runner. Variants carry owned strings so a single
/// failure can be cloned out to every caller waiting on the same download.
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    #[error("Image Resolve Error: {0}")]
    ImageResolve(String),

    #[error("Instance Start Error: {0}")]
    InstanceStart(String),

    #[error("Port Pool Exhausted: {0}")]
    PortPoolExhausted(String),

    #[error("Readiness Timeout: {0}")]
    ReadinessTimeout(String),

    #[error("Agent Returned Status {status}")]
    AgentStatus {
        status: u16,
        body: Vec<u8>,
        content_type: Option<String>,
    },

    #[error("Forward Error: {0}")]
    Forward(String),

    #[error("Deadline Exceeded During {stage}")]
    DeadlineExceeded { stage: String },

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// Stable machine-readable tag, used as the `kind` field of error
    /// responses and preserved in receipts.
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::ImageResolve(_) => "image_resolve",
            RunnerError::InstanceStart(_) => "instance_start",
            RunnerError::PortPoolExhausted(_) => "port_pool_exhausted",
            RunnerError::ReadinessTimeout(_) => "readiness_timeout",
            RunnerError::AgentStatus { .. } => "agent_status",
            RunnerError::Forward(_) => "forward",
            RunnerError::DeadlineExceeded { .. } => "deadline_exceeded",
            RunnerError::Auth(_) => "auth",
            RunnerError::Config(_) => "config",
            RunnerError::Internal(_) => "internal",
        }
    }

    pub fn deadline(stage: impl Into<String>) -> Self {
        RunnerError::DeadlineExceeded {
            stage: stage.into(),
        }
    }
}

// Define the primary Result type for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// One request to execute against an agent image. The payload is opaque to
/// the runner; it is forwarded to the agent byte for byte.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub agent_url: String,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub deadline: Duration,
}

/// Raw response produced by the agent container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
}

/// One recorded stage of an execution.
///
/// `fields` hold the semantic content of the step: two runs of the same
/// deterministic agent against the same input must produce identical
/// `(name, fields)` sequences. Anything that legitimately varies between
/// runs (host ports, byte counts, durations) goes in `incidental` and is
/// excluded from that comparison. `BTreeMap` keeps serialization ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub incidental: BTreeMap<String, String>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Step {
            name: name.into(),
            fields: BTreeMap::new(),
            incidental: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn incidental(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.incidental.insert(key.into(), value.into());
        self
    }
}

/// Ordered record of everything the runner did for one request. Sealed once
/// the request completes; returned to the caller on both success and error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub request_id: String,
    pub agent_url: String,
    pub outcome: Outcome,
    pub steps: Vec<Step>,
}

impl Receipt {
    /// Compares the semantic content of two receipts: step order, step
    /// names and `fields`, ignoring everything `incidental`.
    pub fn semantic_eq(&self, other: &Receipt) -> bool {
        self.outcome == other.outcome
            && self.steps.len() == other.steps.len()
            && self
                .steps
                .iter()
                .zip(other.steps.iter())
                .all(|(a, b)| a.name == b.name && a.fields == b.fields)
    }
}

impl Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        write!(
            f,
            "Receipt(request_id: {}, outcome: {:?}, steps: [{}])",
            self.request_id,
            self.outcome,
            names.join(", ")
        )
    }
}
