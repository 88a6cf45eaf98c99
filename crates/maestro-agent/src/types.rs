use maestro_core::{ErrorInfo, TransactionContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One outbound invocation of a specialized agent. Owned exclusively by the
/// issuing scheduler task for the duration of the call.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub ctx: TransactionContext,
    pub agent_id: String,
    pub input: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Outputs of earlier sequential steps, forwarded as request context.
    pub previous_results: Vec<serde_json::Value>,
    /// Effective deadline for the whole invocation including retries.
    pub deadline: Duration,
}

impl InvocationRequest {
    pub fn new(
        ctx: TransactionContext,
        agent_id: impl Into<String>,
        input: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            ctx,
            agent_id: agent_id.into(),
            input: input.into(),
            parameters: serde_json::Map::new(),
            previous_results: Vec::new(),
            deadline,
        }
    }

    /// Wire body sent to the agent endpoint. The transaction and session
    /// ids travel in the request metadata.
    pub fn wire_body(&self) -> serde_json::Value {
        serde_json::json!({
            "query": self.input,
            "parameters": self.parameters,
            "context": {
                "transaction_id": self.ctx.transaction_id,
                "session_id": self.ctx.session_id,
                "previous_results": self.previous_results,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failed,
    TimedOut,
    Denied,
    Cancelled,
}

/// Outcome of one agent invocation, in the position the plan assigned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub agent_id: String,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub latency_ms: u64,
}

impl InvocationResult {
    pub fn success(agent_id: impl Into<String>, payload: serde_json::Value, latency_ms: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: InvocationStatus::Success,
            payload: Some(payload),
            error: None,
            latency_ms,
        }
    }

    pub fn failure(
        agent_id: impl Into<String>,
        status: InvocationStatus,
        error: ErrorInfo,
        latency_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            payload: None,
            error: Some(error),
            latency_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }
}
