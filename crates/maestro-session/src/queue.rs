use maestro_core::SessionEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// An event together with its position in the session's enqueue sequence.
/// Cursors are `seq` values; a reader holding cursor `c` receives every
/// retained event with `seq >= c`, in order.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub seq: u64,
    pub event: SessionEvent,
}

struct QueueInner {
    events: VecDeque<QueuedEvent>,
    next_seq: u64,
    dropped_total: u64,
}

/// Bounded per-session event queue shared by every transport. Enqueue is
/// atomic and ordering-preserving; any of the scheduler, the streaming
/// layer, and cancellation paths may write. On overflow the oldest
/// non-terminal event is evicted and a `backpressure` marker is enqueued;
/// terminal events are never evicted.
pub struct EventQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    tx: watch::Sender<u64>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            capacity: capacity.max(2),
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                next_seq: 0,
                dropped_total: 0,
            }),
            tx,
        }
    }

    /// Enqueue an event, returning its sequence number.
    pub fn push(&self, event: SessionEvent) -> u64 {
        let seq = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            let mut evicted = 0u64;
            if !event.is_terminal() && inner.events.len() + 1 > self.capacity {
                // Free room for the event plus the backpressure marker.
                while inner.events.len() + 2 > self.capacity {
                    let oldest_droppable =
                        inner.events.iter().position(|q| !q.event.is_terminal());
                    match oldest_droppable {
                        Some(idx) => {
                            inner.events.remove(idx);
                            evicted += 1;
                        }
                        None => break,
                    }
                }
            }
            if evicted > 0 {
                inner.dropped_total += evicted;
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.events.push_back(QueuedEvent {
                    seq,
                    event: SessionEvent::Backpressure { dropped: evicted },
                });
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.events.push_back(QueuedEvent { seq, event });
            seq
        };
        let _ = self.tx.send(seq);
        seq
    }

    /// Blocking pull: waits until at least one retained event has
    /// `seq >= cursor`, then returns the batch and the next cursor.
    /// Returns an empty batch with the unchanged cursor when cancelled.
    pub async fn read_from(
        &self,
        cursor: u64,
        cancel: &CancellationToken,
    ) -> (Vec<QueuedEvent>, u64) {
        let mut rx = self.tx.subscribe();
        loop {
            {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let batch: Vec<QueuedEvent> = inner
                    .events
                    .iter()
                    .filter(|q| q.seq >= cursor)
                    .cloned()
                    .collect();
                if let Some(last) = batch.last() {
                    let next = last.seq + 1;
                    return (batch, next);
                }
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return (Vec::new(), cursor);
                    }
                }
                _ = cancel.cancelled() => return (Vec::new(), cursor),
            }
        }
    }

    /// Non-blocking snapshot of retained events at or past the cursor.
    pub fn peek_from(&self, cursor: u64) -> Vec<QueuedEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .events
            .iter()
            .filter(|q| q.seq >= cursor)
            .cloned()
            .collect()
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dropped_total
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::Phase;
    use std::sync::Arc;

    fn status(n: u64) -> SessionEvent {
        SessionEvent::status(Phase::Iteration, serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn events_delivered_in_enqueue_order() {
        let q = EventQueue::new(16);
        for n in 0..5 {
            q.push(status(n));
        }
        let cancel = CancellationToken::new();
        let (batch, next) = q.read_from(0, &cancel).await;
        assert_eq!(batch.len(), 5);
        assert_eq!(next, 5);
        let seqs: Vec<u64> = batch.iter().map(|q| q.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cursor_resumes_after_delivered_prefix() {
        let q = EventQueue::new(16);
        q.push(status(0));
        q.push(status(1));
        let cancel = CancellationToken::new();
        let (_, next) = q.read_from(0, &cancel).await;
        q.push(status(2));
        let (batch, next2) = q.read_from(next, &cancel).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, 2);
        assert_eq!(next2, 3);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_push() {
        let q = Arc::new(EventQueue::new(16));
        let reader = {
            let q = q.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                q.read_from(0, &cancel).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(status(7));
        let (batch, _) = reader.await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_returns_empty_batch() {
        let q = EventQueue::new(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (batch, next) = q.read_from(0, &cancel).await;
        assert!(batch.is_empty());
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_marks_backpressure() {
        let q = EventQueue::new(4);
        for n in 0..8 {
            q.push(status(n));
        }
        assert!(q.dropped_total() > 0);
        let events = q.peek_from(0);
        assert!(events.len() <= 4);
        assert!(events
            .iter()
            .any(|e| matches!(e.event, SessionEvent::Backpressure { .. })));
        // Retained seqs are still strictly increasing.
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn terminal_events_survive_overflow() {
        let q = EventQueue::new(4);
        q.push(SessionEvent::Complete {
            result: serde_json::json!({"ok": true}),
        });
        for n in 0..10 {
            q.push(status(n));
        }
        let events = q.peek_from(0);
        assert!(events
            .iter()
            .any(|e| matches!(e.event, SessionEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn terminal_push_never_evicts() {
        let q = EventQueue::new(4);
        for n in 0..4 {
            q.push(status(n));
        }
        let before = q.dropped_total();
        q.push(SessionEvent::Closed);
        assert_eq!(q.dropped_total(), before);
        assert!(q
            .peek_from(0)
            .iter()
            .any(|e| matches!(e.event, SessionEvent::Closed)));
    }
}
