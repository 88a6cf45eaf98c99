use crate::queue::{EventQueue, QueuedEvent};
use crate::session::{Session, SessionStatus};
use chrono::Utc;
use maestro_core::{CoreError, CoreResult, Message, SessionConfig, SessionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

struct SessionEntry {
    state: Mutex<Session>,
    queue: EventQueue,
    /// Cancelled when the session closes; in-flight request tasks derive
    /// child tokens from it.
    cancel: CancellationToken,
}

/// Keyed in-memory session collection with absolute TTL and idle timeout.
/// Sufficient for single-instance operation; a multi-instance deployment
/// would put a shared key-value store behind the same surface.
pub struct SessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub async fn create(
        &self,
        user_id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Session {
        let session = Session::new(user_id, metadata);
        let snapshot = session.clone();
        let entry = Arc::new(SessionEntry {
            state: Mutex::new(session),
            queue: EventQueue::new(self.config.event_queue_capacity),
            cancel: CancellationToken::new(),
        });
        self.sessions.write().await.insert(snapshot.id, entry);
        info!(session_id = %snapshot.id, "session created");
        snapshot
    }

    async fn entry(&self, id: Uuid) -> CoreResult<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::SessionNotFound(id))
    }

    /// Snapshot of the session state. A session past its absolute TTL that
    /// the sweep has not yet collected reports `SessionExpired`.
    pub async fn get(&self, id: Uuid) -> CoreResult<Session> {
        let entry = self.entry(id).await?;
        let state = entry.state.lock().await;
        if !state.is_closed() && state.ttl_expired(self.config.ttl(), Utc::now()) {
            return Err(CoreError::SessionExpired(id));
        }
        Ok(state.clone())
    }

    pub async fn append_message(&self, id: Uuid, message: Message) -> CoreResult<()> {
        let entry = self.entry(id).await?;
        let mut state = entry.state.lock().await;
        if state.is_closed() {
            return Err(CoreError::SessionClosed(id));
        }
        state.append_message(message);
        Ok(())
    }

    pub async fn set_status(&self, id: Uuid, status: SessionStatus) -> CoreResult<()> {
        let entry = self.entry(id).await?;
        let mut state = entry.state.lock().await;
        if state.is_closed() {
            return Err(CoreError::SessionClosed(id));
        }
        state.status = status;
        state.touch();
        Ok(())
    }

    /// Push an event to the session's queue, returning its sequence number.
    pub async fn enqueue_event(&self, id: Uuid, event: SessionEvent) -> CoreResult<u64> {
        let entry = self.entry(id).await?;
        {
            let state = entry.state.lock().await;
            if state.is_closed() {
                return Err(CoreError::SessionClosed(id));
            }
        }
        Ok(entry.queue.push(event))
    }

    /// Blocking pull of events at or past `cursor`, in enqueue order.
    /// Cancellation (transport disconnect) yields an empty batch; it does
    /// not close the session.
    pub async fn dequeue_events(
        &self,
        id: Uuid,
        cursor: u64,
        cancel: &CancellationToken,
    ) -> CoreResult<(Vec<QueuedEvent>, u64)> {
        let entry = self.entry(id).await?;
        Ok(entry.queue.read_from(cursor, cancel).await)
    }

    /// Token cancelled when the session closes. Request tasks derive child
    /// tokens so closure propagates to everything the session owns.
    pub async fn cancellation_token(&self, id: Uuid) -> CoreResult<CancellationToken> {
        Ok(self.entry(id).await?.cancel.clone())
    }

    /// Transition to closed, cancel in-flight work, flush the terminal
    /// `closed` event. Deletion happens at the next sweep. Idempotent.
    pub async fn close(&self, id: Uuid) -> CoreResult<()> {
        let entry = self.entry(id).await?;
        {
            let mut state = entry.state.lock().await;
            if state.is_closed() {
                return Ok(());
            }
            state.status = SessionStatus::Closed;
            state.closed_at = Some(Utc::now());
        }
        entry.cancel.cancel();
        entry.queue.push(SessionEvent::Closed);
        info!(session_id = %id, "session closed");
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove sessions whose absolute TTL or idle timeout is exceeded
    /// (closing them first so connected transports observe `closed`), and
    /// collect sessions already closed. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.config.ttl();
        let idle = self.config.idle_timeout();

        let candidates: Vec<(Uuid, Arc<SessionEntry>)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        let mut remove = Vec::new();
        for (id, entry) in candidates {
            let mut state = entry.state.lock().await;
            if state.is_closed() {
                remove.push(id);
                continue;
            }
            if state.ttl_expired(ttl, now) || state.idle_expired(idle, now) {
                state.status = SessionStatus::Closed;
                state.closed_at = Some(now);
                drop(state);
                entry.cancel.cancel();
                entry.queue.push(SessionEvent::Closed);
                remove.push(id);
            }
        }

        if remove.is_empty() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for id in remove {
            if sessions.remove(&id).is_some() {
                debug!(session_id = %id, "session swept");
                removed += 1;
            }
        }
        removed
    }

    /// Background expiry sweep at a fixed interval. One task per process;
    /// readers are never blocked for longer than a map snapshot.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let period = Duration::from_secs(store.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired().await;
                        if removed > 0 {
                            info!(removed, "expiry sweep collected sessions");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
