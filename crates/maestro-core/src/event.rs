use crate::error::ErrorEnvelope;
use crate::message::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scheduler progress phases surfaced through `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Dispatching,
    AgentStart,
    AgentComplete,
    Iteration,
    Complete,
}

/// Events pushed to a session's bounded queue and delivered, in enqueue
/// order, on every connected transport. Payload shapes are stable;
/// evolution is additive-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        phase: Phase,
        info: serde_json::Value,
    },
    Message {
        role: Role,
        content: String,
        #[serde(default)]
        metadata: HashMap<String, serde_json::Value>,
    },
    /// Terminal: the full orchestration result for the current request.
    Complete {
        result: serde_json::Value,
    },
    /// Terminal: the request ended in an error.
    Error {
        #[serde(flatten)]
        error: ErrorEnvelope,
    },
    /// Oldest non-terminal events were evicted from a full queue.
    Backpressure {
        dropped: u64,
    },
    /// Terminal: the session itself was closed.
    Closed,
}

impl SessionEvent {
    /// Terminal events end a response stream and are never dropped from the
    /// queue under backpressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Complete { .. } | SessionEvent::Error { .. } | SessionEvent::Closed
        )
    }

    /// Wire name of the event, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Status { .. } => "status",
            SessionEvent::Message { .. } => "message",
            SessionEvent::Complete { .. } => "complete",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Backpressure { .. } => "backpressure",
            SessionEvent::Closed => "closed",
        }
    }

    pub fn status(phase: Phase, info: serde_json::Value) -> Self {
        SessionEvent::Status { phase, info }
    }
}
