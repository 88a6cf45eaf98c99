use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_ROLE: &str = "tool_user";

/// Correlation context created at the top of every externally-initiated
/// operation and carried through every downstream call, log entry, and
/// audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionContext {
    pub transaction_id: Uuid,
    pub session_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub role: String,
    pub started_at: DateTime<Utc>,
    /// Logical parent for nested calls (tool calls made on behalf of an
    /// agent invocation). The transaction id itself never changes.
    pub parent: Option<Uuid>,
}

impl TransactionContext {
    pub fn root(session_id: Option<Uuid>, user_id: Option<String>, role: Option<String>) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            session_id,
            user_id,
            role: role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            started_at: Utc::now(),
            parent: None,
        }
    }

    /// A nested context sharing the same transaction id, with this context
    /// recorded as the logical parent.
    pub fn child(&self) -> Self {
        Self {
            transaction_id: self.transaction_id,
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            role: self.role.clone(),
            started_at: Utc::now(),
            parent: Some(self.transaction_id),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}
