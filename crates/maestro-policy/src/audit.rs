use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// One governance record. Append-only; retained in memory up to a
/// configured size, optionally mirrored to a sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub transaction_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub subject: Option<String>,
    pub role: String,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: String,
    pub decision: String,
    pub latency_ms: u64,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Bounded in-memory audit trail with an optional sink for durability.
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn append(&self, entry: AuditEntry) {
        info!(
            transaction_id = %entry.transaction_id,
            resource = %format!("{}:{}", entry.resource_type, entry.resource_id),
            operation = %entry.operation,
            decision = %entry.decision,
            "audit"
        );
        if let Some(sink) = &self.sink {
            sink.record(&entry);
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest-first slice of the trail.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn by_transaction(&self, transaction_id: Uuid) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn decision_counts(&self) -> (u64, u64) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut allowed = 0;
        let mut denied = 0;
        for e in entries.iter() {
            if e.decision.starts_with("deny") {
                denied += 1;
            } else {
                allowed += 1;
            }
        }
        (allowed, denied)
    }
}

/// Mirrors audit entries to an append-only JSONL file via a background
/// writer task, so the hot path never touches the filesystem.
pub struct JsonlAuditSink {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl JsonlAuditSink {
    pub fn new(dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = tokio::fs::create_dir_all(&dir).await;
            let path = dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "audit sink disabled");
                    return;
                }
            };
            while let Some(entry) = rx.recv().await {
                if let Ok(mut line) = serde_json::to_string(&entry) {
                    line.push('\n');
                    let _ = file.write_all(line.as_bytes()).await;
                }
            }
        });
        Self { tx }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, entry: &AuditEntry) {
        let _ = self.tx.send(entry.clone());
    }
}
