use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// A named skill an agent declares. Complexity and duration are
/// informational; matching uses the name only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_score")]
    pub complexity_score: f64,
    #[serde(default = "default_score")]
    pub estimated_duration: f64,
}

fn default_score() -> f64 {
    1.0
}

impl Capability {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            complexity_score: 1.0,
            estimated_duration: 1.0,
        }
    }
}

/// Derived health. Never stored on the record: computed at query time from
/// heartbeat freshness and load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// Registration state for one specialized agent. Owned by the registry,
/// updated only on heartbeat and deregister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub endpoint: String,
    #[serde(default)]
    pub load: u32,
    #[serde(default = "default_capacity")]
    pub max_capacity: u32,
    pub last_heartbeat: DateTime<Utc>,
    /// Self-reported status from the last heartbeat; only ever downgrades
    /// the derived health.
    #[serde(default)]
    pub reported_status: Option<AgentHealth>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_capacity() -> u32 {
    10
}

impl AgentRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            endpoint: endpoint.into(),
            load: 0,
            max_capacity: default_capacity(),
            last_heartbeat: Utc::now(),
            reported_status: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_capacity(mut self, max_capacity: u32) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// `unreachable` when the heartbeat is stale; otherwise `degraded` at or
    /// past capacity (or when self-reported), else `healthy`.
    pub fn health(&self, heartbeat_timeout: Duration, now: DateTime<Utc>) -> AgentHealth {
        let stale = match chrono::Duration::from_std(heartbeat_timeout) {
            Ok(timeout) => now - self.last_heartbeat > timeout,
            Err(_) => false,
        };
        if stale {
            return AgentHealth::Unreachable;
        }
        if self.reported_status == Some(AgentHealth::Degraded)
            || self.reported_status == Some(AgentHealth::Unreachable)
        {
            return AgentHealth::Degraded;
        }
        if self.load >= self.max_capacity {
            AgentHealth::Degraded
        } else {
            AgentHealth::Healthy
        }
    }

    /// Eligible for a requirement set iff its capability set is a superset.
    pub fn covers(&self, requirements: &[String]) -> bool {
        requirements.iter().all(|r| self.capabilities.contains(r))
    }
}

/// A record paired with its health as derived at lookup time.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub health: AgentHealth,
}
