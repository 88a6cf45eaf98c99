use crate::record::{AgentHealth, AgentRecord, AgentSnapshot};
use chrono::Utc;
use maestro_core::{CoreError, CoreResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// How `select` orders the eligible agents.
#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    /// Minimum load first; ties broken by most-recent heartbeat, then by
    /// stable id order. Healthy agents sort before degraded ones.
    LeastLoaded,
    /// Per-capability cursor; skips non-healthy agents.
    RoundRobin,
    /// Caller supplied explicit agent ids; they must still be healthy or
    /// degraded.
    Pinned(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub capability: Option<String>,
    pub health: Option<AgentHealth>,
}

/// Live agent records with capability-based lookup and load-balanced
/// selection. Readers take snapshots; writers are serialized.
pub struct AgentRegistry {
    heartbeat_timeout: Duration,
    agents: RwLock<HashMap<String, AgentRecord>>,
    /// Round-robin cursors keyed by the joined requirement set.
    cursors: Mutex<HashMap<String, usize>>,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            agents: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert by id. A name already bound to a different id is rejected.
    pub async fn register(&self, record: AgentRecord) -> CoreResult<()> {
        let mut agents = self.agents.write().await;
        if let Some(existing) = agents
            .values()
            .find(|a| a.name == record.name && a.id != record.id)
        {
            return Err(CoreError::InvalidRequest(format!(
                "agent name '{}' is already bound to id '{}'",
                record.name, existing.id
            )));
        }
        info!(agent_id = %record.id, name = %record.name, "agent registered");
        agents.insert(record.id.clone(), record);
        Ok(())
    }

    /// Refresh the heartbeat timestamp, load, and optional self-reported
    /// status.
    pub async fn heartbeat(
        &self,
        id: &str,
        load: u32,
        status: Option<AgentHealth>,
    ) -> CoreResult<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(id)
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown agent id '{id}'")))?;
        record.last_heartbeat = Utc::now();
        record.load = load;
        record.reported_status = status;
        debug!(agent_id = %id, load, "heartbeat");
        Ok(())
    }

    /// Graceful removal. Unknown ids are a no-op.
    pub async fn deregister(&self, id: &str) {
        if self.agents.write().await.remove(id).is_some() {
            info!(agent_id = %id, "agent deregistered");
        }
    }

    pub async fn get(&self, id: &str) -> Option<AgentSnapshot> {
        let now = Utc::now();
        self.agents.read().await.get(id).map(|r| AgentSnapshot {
            health: r.health(self.heartbeat_timeout, now),
            record: r.clone(),
        })
    }

    /// Snapshot of all records, with derived health, optionally filtered.
    pub async fn list_all(&self, filter: Option<&AgentFilter>) -> Vec<AgentSnapshot> {
        let now = Utc::now();
        let agents = self.agents.read().await;
        let mut out: Vec<AgentSnapshot> = agents
            .values()
            .map(|r| AgentSnapshot {
                health: r.health(self.heartbeat_timeout, now),
                record: r.clone(),
            })
            .filter(|snap| match filter {
                Some(f) => {
                    f.capability
                        .as_ref()
                        .is_none_or(|c| snap.record.capabilities.contains(c))
                        && f.health.is_none_or(|h| snap.health == h)
                }
                None => true,
            })
            .collect();
        out.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        out
    }

    /// Agents covering the requirement set, ordered by the strategy.
    /// `unreachable` agents are never returned; an empty result means no
    /// eligible agent and the caller decides what that implies.
    pub async fn select(
        &self,
        requirements: &[String],
        strategy: &SelectionStrategy,
    ) -> Vec<AgentSnapshot> {
        let now = Utc::now();
        let agents = self.agents.read().await;

        match strategy {
            SelectionStrategy::Pinned(ids) => ids
                .iter()
                .filter_map(|id| agents.get(id))
                .map(|r| AgentSnapshot {
                    health: r.health(self.heartbeat_timeout, now),
                    record: r.clone(),
                })
                .filter(|s| s.health != AgentHealth::Unreachable)
                .collect(),

            SelectionStrategy::LeastLoaded => {
                let mut eligible: Vec<AgentSnapshot> = agents
                    .values()
                    .filter(|r| r.covers(requirements))
                    .map(|r| AgentSnapshot {
                        health: r.health(self.heartbeat_timeout, now),
                        record: r.clone(),
                    })
                    .filter(|s| s.health != AgentHealth::Unreachable)
                    .collect();
                eligible.sort_by(|a, b| {
                    let rank = |h: AgentHealth| match h {
                        AgentHealth::Healthy => 0u8,
                        _ => 1,
                    };
                    rank(a.health)
                        .cmp(&rank(b.health))
                        .then(a.record.load.cmp(&b.record.load))
                        .then(b.record.last_heartbeat.cmp(&a.record.last_heartbeat))
                        .then(a.record.id.cmp(&b.record.id))
                });
                eligible
            }

            SelectionStrategy::RoundRobin => {
                let mut eligible: Vec<AgentSnapshot> = agents
                    .values()
                    .filter(|r| r.covers(requirements))
                    .map(|r| AgentSnapshot {
                        health: r.health(self.heartbeat_timeout, now),
                        record: r.clone(),
                    })
                    .filter(|s| s.health == AgentHealth::Healthy)
                    .collect();
                eligible.sort_by(|a, b| a.record.id.cmp(&b.record.id));
                if eligible.is_empty() {
                    return eligible;
                }
                let key = requirements.join("+");
                let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
                let cursor = cursors.entry(key).or_insert(0);
                let offset = *cursor % eligible.len();
                *cursor = cursor.wrapping_add(1);
                eligible.rotate_left(offset);
                eligible
            }
        }
    }

    /// Capability → agent ids, for the planner's capability snapshot. Only
    /// reachable agents contribute.
    pub async fn capability_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let now = Utc::now();
        let agents = self.agents.read().await;
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in agents.values() {
            if record.health(self.heartbeat_timeout, now) == AgentHealth::Unreachable {
                continue;
            }
            for cap in &record.capabilities {
                map.entry(cap.clone()).or_default().push(record.id.clone());
            }
        }
        for ids in map.values_mut() {
            ids.sort();
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn registry() -> AgentRegistry {
        AgentRegistry::new(TIMEOUT)
    }

    fn record(id: &str, caps: &[&str]) -> AgentRecord {
        AgentRecord::new(
            id,
            format!("{id}-name"),
            caps.iter().map(|c| c.to_string()),
            format!("http://{id}"),
        )
        .with_capacity(4)
    }

    fn reqs(caps: &[&str]) -> Vec<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn register_rejects_name_bound_to_other_id() {
        let reg = registry();
        reg.register(record("a1", &["search"])).await.unwrap();

        let mut clash = record("a2", &["search"]);
        clash.name = "a1-name".to_string();
        let err = reg.register(clash).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");

        // Same id re-registering under the same name is an upsert.
        reg.register(record("a1", &["search", "reporting"]))
            .await
            .unwrap();
        let snap = reg.get("a1").await.unwrap();
        assert!(snap.record.capabilities.contains("reporting"));
    }

    #[tokio::test]
    async fn stale_agents_are_never_selected() {
        let reg = registry();
        let mut stale = record("a1", &["search"]);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        reg.register(stale).await.unwrap();

        let picked = reg
            .select(&reqs(&["search"]), &SelectionStrategy::LeastLoaded)
            .await;
        assert!(picked.is_empty());

        let pinned = reg
            .select(&[], &SelectionStrategy::Pinned(vec!["a1".to_string()]))
            .await;
        assert!(pinned.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_revives_and_updates_load() {
        let reg = registry();
        let mut stale = record("a1", &["search"]);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        reg.register(stale).await.unwrap();

        reg.heartbeat("a1", 2, None).await.unwrap();
        let snap = reg.get("a1").await.unwrap();
        assert_eq!(snap.health, AgentHealth::Healthy);
        assert_eq!(snap.record.load, 2);

        let err = reg.heartbeat("ghost", 0, None).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn least_loaded_prefers_low_load_then_id() {
        let reg = registry();
        let mut a = record("a1", &["search"]);
        a.load = 3;
        let mut b = record("a2", &["search"]);
        b.load = 1;
        let mut c = record("a3", &["search"]);
        c.load = 1;
        // a2 and a3 tie on load and (close) heartbeats; force the tie to
        // fall through to id order.
        let beat = Utc::now();
        b.last_heartbeat = beat;
        c.last_heartbeat = beat;
        reg.register(a).await.unwrap();
        reg.register(b).await.unwrap();
        reg.register(c).await.unwrap();

        let picked = reg
            .select(&reqs(&["search"]), &SelectionStrategy::LeastLoaded)
            .await;
        assert_eq!(picked[0].record.id, "a2");
        assert_eq!(picked[1].record.id, "a3");
        assert_eq!(picked[2].record.id, "a1");
    }

    #[tokio::test]
    async fn least_loaded_prefers_healthy_over_degraded() {
        let reg = registry();
        let mut busy = record("a1", &["search"]);
        busy.load = 4; // at capacity -> degraded
        let mut light = record("a2", &["search"]);
        light.load = 3;
        reg.register(busy).await.unwrap();
        reg.register(light).await.unwrap();

        let picked = reg
            .select(&reqs(&["search"]), &SelectionStrategy::LeastLoaded)
            .await;
        assert_eq!(picked[0].record.id, "a2");
        assert_eq!(picked[0].health, AgentHealth::Healthy);
        assert_eq!(picked[1].health, AgentHealth::Degraded);
    }

    #[tokio::test]
    async fn round_robin_rotates_and_skips_degraded() {
        let reg = registry();
        reg.register(record("a1", &["search"])).await.unwrap();
        reg.register(record("a2", &["search"])).await.unwrap();
        let mut degraded = record("a3", &["search"]);
        degraded.load = 4;
        reg.register(degraded).await.unwrap();

        let first = reg
            .select(&reqs(&["search"]), &SelectionStrategy::RoundRobin)
            .await;
        let second = reg
            .select(&reqs(&["search"]), &SelectionStrategy::RoundRobin)
            .await;
        assert_eq!(first.len(), 2, "degraded agent skipped");
        assert_ne!(first[0].record.id, second[0].record.id);
    }

    #[tokio::test]
    async fn capability_matching_requires_superset() {
        let reg = registry();
        reg.register(record("a1", &["search"])).await.unwrap();
        reg.register(record("a2", &["search", "reporting"]))
            .await
            .unwrap();

        let both = reg
            .select(
                &reqs(&["search", "reporting"]),
                &SelectionStrategy::LeastLoaded,
            )
            .await;
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].record.id, "a2");

        let none = reg
            .select(&reqs(&["analytics"]), &SelectionStrategy::LeastLoaded)
            .await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn pinned_preserves_order_and_drops_unknown() {
        let reg = registry();
        reg.register(record("a1", &["search"])).await.unwrap();
        reg.register(record("a2", &["reporting"])).await.unwrap();

        let picked = reg
            .select(
                &[],
                &SelectionStrategy::Pinned(vec![
                    "a2".to_string(),
                    "ghost".to_string(),
                    "a1".to_string(),
                ]),
            )
            .await;
        let ids: Vec<&str> = picked.iter().map(|s| s.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
    }

    #[tokio::test]
    async fn capability_snapshot_excludes_unreachable() {
        let reg = registry();
        reg.register(record("a1", &["search"])).await.unwrap();
        let mut stale = record("a2", &["search", "analytics"]);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(300);
        reg.register(stale).await.unwrap();

        let snap = reg.capability_snapshot().await;
        assert_eq!(snap["search"], vec!["a1".to_string()]);
        assert!(!snap.contains_key("analytics"));
    }

    #[tokio::test]
    async fn deregister_removes_agent() {
        let reg = registry();
        reg.register(record("a1", &["search"])).await.unwrap();
        reg.deregister("a1").await;
        assert!(reg.get("a1").await.is_none());
        // Idempotent.
        reg.deregister("a1").await;
    }
}
