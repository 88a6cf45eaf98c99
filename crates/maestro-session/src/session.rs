use chrono::{DateTime, Utc};
use maestro_core::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Processing,
    /// Terminal. A closed session never transitions back.
    Closed,
}

/// Ephemeral conversational context. Owned by the streaming layer; reached
/// by id through the store, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(user_id: Option<String>, metadata: HashMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: SessionStatus::Idle,
            created_at: now,
            last_touched: now,
            closed_at: None,
            messages: Vec::new(),
            metadata,
        }
    }

    pub fn touch(&mut self) {
        self.last_touched = Utc::now();
    }

    /// Appends to the message log. The log is append-only; entries are
    /// never mutated afterwards.
    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    pub fn ttl_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.created_at > ttl,
            Err(_) => false,
        }
    }

    pub fn idle_expired(&self, idle_timeout: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(idle_timeout) {
            Ok(idle) => now - self.last_touched > idle,
            Err(_) => false,
        }
    }
}
