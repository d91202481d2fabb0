//! Batch progress reporting
//!
//! The orchestrator publishes a completion percentage per batch through a
//! [`ProgressSink`] after every equivalence class. Entries expire after an
//! explicit TTL so abandoned batches do not linger.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::MatchResult;

/// Receiver of per-batch progress percentages (0.0 - 100.0)
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn set_progress(&self, batch_id: Uuid, percent: f64, ttl: Duration) -> MatchResult<()>;
}

/// Process-local TTL cache of progress values
#[derive(Debug, Default)]
pub struct MemoryProgressCache {
    entries: RwLock<HashMap<Uuid, (f64, Instant)>>,
}

impl MemoryProgressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, if set and not expired
    pub async fn get(&self, batch_id: Uuid) -> Option<f64> {
        let entries = self.entries.read().await;
        entries
            .get(&batch_id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(percent, _)| *percent)
    }

    /// `{"<batch_id>": {"progress": <percent>}}`, or null when absent
    pub async fn to_json(&self, batch_id: Uuid) -> serde_json::Value {
        match self.get(batch_id).await {
            Some(percent) => json!({ batch_id.to_string(): { "progress": percent } }),
            None => serde_json::Value::Null,
        }
    }

    /// Drop expired entries; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl ProgressSink for MemoryProgressCache {
    async fn set_progress(&self, batch_id: Uuid, percent: f64, ttl: Duration) -> MatchResult<()> {
        let percent = percent.clamp(0.0, 100.0);
        self.entries
            .write()
            .await
            .insert(batch_id, (percent, Instant::now() + ttl));

        tracing::trace!(batch_id = %batch_id, percent, "Progress updated");
        Ok(())
    }
}

/// Percentage of `done` out of `total`; an empty batch is complete
pub fn percent_complete(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64 * 100.0).min(100.0)
    }
}
