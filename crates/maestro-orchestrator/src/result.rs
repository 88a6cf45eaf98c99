use chrono::{DateTime, Utc};
use maestro_agent::InvocationResult;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub results: Vec<InvocationResult>,
}

/// Aggregated outcome of one top-level request. Pushed to the session's
/// event queue as the terminal `complete` payload.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub transaction_id: Uuid,
    pub pattern: String,
    pub user_override: bool,
    pub agents: Vec<String>,
    /// Per-agent results in plan order. For loops: the last iteration.
    pub results: Vec<InvocationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<Vec<IterationRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations_completed: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl OrchestrationResult {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn summary(&self) -> String {
        match self.iterations_completed {
            Some(iterations) => format!(
                "{} pattern finished after {} iteration(s); last iteration {}/{} succeeded",
                self.pattern,
                iterations,
                self.succeeded(),
                self.results.len()
            ),
            None => format!(
                "{} pattern finished; {}/{} agent(s) succeeded",
                self.pattern,
                self.succeeded(),
                self.results.len()
            ),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}
