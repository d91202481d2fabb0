//! Test Helper Utilities
//!
//! Shared fixtures for seed-match integration tests: record builders, batch
//! seeding and orchestrators over the memory and SQLite stores.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;
use uuid::Uuid;

use seed_match::models::{FieldValue, ImportBatch, Record, RecordKind};
use seed_match::services::{MemoryProgressCache, ProgressSink};
use seed_match::{
    ChangeSet, MatchConfig, MatchOrchestrator, MatchResult, MemoryStore, SqliteStore, StateStore,
};

pub const ORG: i64 = 1;

/// Property row with the given fields, hashed, created `offset_ms` after a
/// fixed base time so merge order is predictable
pub fn property(offset_ms: i64, fields: &[(&str, FieldValue)]) -> Record {
    let mut record = Record::new(RecordKind::Property, ORG);
    for (key, value) in fields {
        record.fields.insert(key.to_string(), value.clone());
    }
    let at = base_time() + Duration::milliseconds(offset_ms);
    record.created_at = at;
    record.updated_at = at;
    record.rehash().unwrap();
    record
}

/// Shorthand for a text field value
pub fn text(value: &str) -> FieldValue {
    FieldValue::from(value)
}

fn base_time() -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Memory store, progress cache and orchestrator with default config
pub fn memory_setup() -> (Arc<MemoryStore>, Arc<MemoryProgressCache>, MatchOrchestrator) {
    memory_setup_with(MatchConfig::default())
}

pub fn memory_setup_with(
    config: MatchConfig,
) -> (Arc<MemoryStore>, Arc<MemoryProgressCache>, MatchOrchestrator) {
    let store = Arc::new(MemoryStore::new());
    let progress = Arc::new(MemoryProgressCache::new());
    let orchestrator = MatchOrchestrator::new(store.clone(), progress.clone(), config);
    (store, progress, orchestrator)
}

/// Save a mapped batch for `cycle_id` and store `records` in it
pub async fn seed_batch(
    store: &dyn StateStore,
    cycle_id: Uuid,
    filename: &str,
    records: Vec<Record>,
) -> (ImportBatch, Vec<Record>) {
    let batch = ImportBatch::new_mapped(
        ORG,
        cycle_id,
        RecordKind::Property,
        Some(format!("/srv/uploads/{}", filename)),
    );
    store.save_batch(&batch).await.unwrap();

    let records: Vec<Record> = records.into_iter().map(|r| r.in_batch(batch.id)).collect();
    let mut changes = ChangeSet::new();
    for record in &records {
        changes.upsert_record(record.clone());
    }
    store.commit(changes).await.unwrap();

    (batch, records)
}

/// Create temporary on-disk SQLite store with the schema applied
///
/// Returns (TempDir, store) - TempDir must be kept alive for duration of test
pub async fn sqlite_setup() -> (TempDir, Arc<SqliteStore>) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("seed_match_test.db");
    let pool = seed_common::db::init_database(&db_path).await.unwrap();
    let store = SqliteStore::open(pool).await.unwrap();
    (temp_dir, Arc::new(store))
}

/// Action run by [`FirstClassHook`]
pub type Hook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Progress sink that runs a hook once, when the first class of a run
/// finishes (the first non-zero progress value)
#[derive(Default)]
pub struct FirstClassHook {
    hook: OnceLock<Hook>,
    fired: AtomicBool,
}

impl FirstClassHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook; usually after the orchestrator that calls it exists
    pub fn set(&self, hook: Hook) {
        assert!(self.hook.set(hook).is_ok(), "hook already set");
    }
}

#[async_trait]
impl ProgressSink for FirstClassHook {
    async fn set_progress(
        &self,
        _batch_id: Uuid,
        percent: f64,
        _ttl: std::time::Duration,
    ) -> MatchResult<()> {
        if percent > 0.0 && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.hook.get() {
                hook().await;
            }
        }
        Ok(())
    }
}

/// Memory store and orchestrator reporting to a [`FirstClassHook`]
pub fn hooked_setup(config: MatchConfig) -> (Arc<MemoryStore>, Arc<FirstClassHook>, MatchOrchestrator) {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(FirstClassHook::new());
    let orchestrator = MatchOrchestrator::new(store.clone(), sink.clone(), config);
    (store, sink, orchestrator)
}
