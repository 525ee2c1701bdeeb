//! Receipt assembly and delivery. The recorder collects steps in execution
//! order; the uploader ships sealed receipts to an optional collector
//! without blocking the request path.

use runner_common::{Outcome, Receipt, Step};
use tracing::{debug, warn};

pub struct ReceiptRecorder {
    request_id: String,
    agent_url: String,
    steps: Vec<Step>,
}

impl ReceiptRecorder {
    pub fn new(request_id: &str, agent_url: &str) -> ReceiptRecorder {
        ReceiptRecorder {
            request_id: request_id.to_string(),
            agent_url: agent_url.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: Step) {
        debug!(request_id = %self.request_id, step = %step.name, "recorded step");
        self.steps.push(step);
    }

    pub fn finish(self, outcome: Outcome) -> Receipt {
        Receipt {
            request_id: self.request_id,
            agent_url: self.agent_url,
            outcome,
            steps: self.steps,
        }
    }
}

/// Posts receipts to a collector endpoint, fire and forget. With no
/// collector configured, publishing is a no-op.
#[derive(Clone)]
pub struct ReceiptUploader {
    client: reqwest::Client,
    url: Option<String>,
}

impl ReceiptUploader {
    pub fn new(url: Option<String>) -> ReceiptUploader {
        ReceiptUploader {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Uploads on a background task; delivery failures are logged and
    /// never affect the request that produced the receipt.
    pub fn publish(&self, receipt: &Receipt) {
        let Some(url) = self.url.clone() else { return };
        let client = self.client.clone();
        let receipt = receipt.clone();
        tokio::spawn(async move {
            let request_id = receipt.request_id.clone();
            match client.post(&url).json(&receipt).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%request_id, "receipt uploaded");
                }
                Ok(response) => {
                    warn!(
                        %request_id,
                        status = response.status().as_u16(),
                        "receipt collector rejected upload"
                    );
                }
                Err(e) => {
                    warn!(%request_id, error = %e, "receipt upload failed");
                }
            }
        });
    }
}
