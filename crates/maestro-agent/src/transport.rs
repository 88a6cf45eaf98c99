use crate::types::InvocationRequest;
use async_trait::async_trait;
use maestro_core::{CoreError, CoreResult};

/// Wire-level delivery of one invocation attempt. Retries, deadlines, and
/// cancellation live in `AgentClient`; a transport only performs a single
/// exchange and classifies its failure.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, endpoint: &str, request: &InvocationRequest) -> CoreResult<serde_json::Value>;
}

/// HTTP transport: `POST {endpoint}/process_request` with the JSON wire
/// body; the transaction id also travels as a header for edge logging.
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAgentTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn send(&self, endpoint: &str, request: &InvocationRequest) -> CoreResult<serde_json::Value> {
        let url = format!("{}/process_request", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-transaction-id", request.ctx.transaction_id.to_string())
            .json(&request.wire_body())
            .send()
            .await
            .map_err(|e| {
                // Network-level failures (refused, reset, DNS) are the
                // transient class the client retries.
                CoreError::AgentUnreachable(format!("{}: {e}", request.agent_id))
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CoreError::AgentUnreachable(format!(
                "{}: upstream {status}",
                request.agent_id
            )));
        }
        if !status.is_success() {
            return Err(CoreError::AgentFailed(format!(
                "{}: upstream {status}",
                request.agent_id
            )));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| CoreError::AgentFailed(format!("{}: bad response body: {e}", request.agent_id)))
    }
}
