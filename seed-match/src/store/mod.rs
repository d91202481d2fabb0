//! Persistent state store interface
//!
//! The matching engine reads and writes records, lineage nodes, canonical
//! entities, views and batches only through [`StateStore`]. All writes of
//! one unit of work go through [`StateStore::commit`], which applies a
//! [`ChangeSet`] atomically.
//!
//! Implementations:
//! - [`MemoryStore`]: arena-backed, used by tests and embedding callers
//! - [`SqliteStore`]: sqlx/SQLite, used by the CLI

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::MatchResult;
use crate::models::{
    AuditNode, CanonicalEntity, DataState, ImportBatch, MergeState, Record, RecordKind, View,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Record query; unset criteria match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub organization_id: Option<i64>,
    pub batch_id: Option<Uuid>,
    pub data_state: Option<DataState>,
    pub merge_state: Option<MergeState>,
    pub kind: Option<RecordKind>,
}

impl RecordFilter {
    /// Records of one batch awaiting matching
    pub fn ready_for_matching(batch_id: Uuid) -> Self {
        Self {
            batch_id: Some(batch_id),
            data_state: Some(DataState::Mapped),
            merge_state: Some(MergeState::Unknown),
            ..Self::default()
        }
    }

    pub fn in_batch(batch_id: Uuid) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Self::default()
        }
    }

    pub fn organization(mut self, organization_id: i64) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn merge_state(mut self, merge_state: MergeState) -> Self {
        self.merge_state = Some(merge_state);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.organization_id.map_or(true, |o| o == record.organization_id)
            && self.batch_id.map_or(true, |b| record.import_batch_id == Some(b))
            && self.data_state.map_or(true, |d| d == record.data_state)
            && self.merge_state.map_or(true, |m| m == record.merge_state)
            && self.kind.map_or(true, |k| k == record.kind)
    }
}

/// Writes applied atomically by [`StateStore::commit`].
///
/// Application order: record deletes, record upserts, node deletes, node
/// inserts, entity upserts, view deletes, view upserts. A view upsert for an
/// (entity, cycle) pair that already has a view rebinds the existing view.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub records_delete: Vec<Uuid>,
    pub records_upsert: Vec<Record>,
    pub nodes_delete: Vec<Uuid>,
    pub nodes_insert: Vec<AuditNode>,
    pub entities_upsert: Vec<CanonicalEntity>,
    pub views_delete: Vec<Uuid>,
    pub views_upsert: Vec<View>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records_delete.is_empty()
            && self.records_upsert.is_empty()
            && self.nodes_delete.is_empty()
            && self.nodes_insert.is_empty()
            && self.entities_upsert.is_empty()
            && self.views_delete.is_empty()
            && self.views_upsert.is_empty()
    }

    /// Number of rows touched
    pub fn len(&self) -> usize {
        self.records_delete.len()
            + self.records_upsert.len()
            + self.nodes_delete.len()
            + self.nodes_insert.len()
            + self.entities_upsert.len()
            + self.views_delete.len()
            + self.views_upsert.len()
    }

    /// Add or replace a pending record upsert
    pub fn upsert_record(&mut self, record: Record) {
        if let Some(existing) = self.records_upsert.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            self.records_upsert.push(record);
        }
    }

    /// Add or replace a pending entity upsert
    pub fn upsert_entity(&mut self, entity: CanonicalEntity) {
        if let Some(existing) = self.entities_upsert.iter_mut().find(|e| e.id == entity.id) {
            *existing = entity;
        } else {
            self.entities_upsert.push(entity);
        }
    }

    /// Add or replace a pending view upsert for the same (entity, cycle)
    pub fn upsert_view(&mut self, view: View) {
        if let Some(existing) = self
            .views_upsert
            .iter_mut()
            .find(|v| v.entity_id == view.entity_id && v.cycle_id == view.cycle_id)
        {
            *existing = view;
        } else {
            self.views_upsert.push(view);
        }
    }
}

/// Persistent store for matching state
#[async_trait]
pub trait StateStore: Send + Sync {
    // Records

    async fn get_record(&self, id: Uuid) -> MatchResult<Option<Record>>;

    /// Records matching `filter`, in insertion order
    async fn find_records(&self, filter: &RecordFilter) -> MatchResult<Vec<Record>>;

    // Lineage

    async fn get_audit_node(&self, id: Uuid) -> MatchResult<Option<AuditNode>>;

    /// Nodes describing `record_id`, oldest sequence first
    async fn audit_nodes_for_record(&self, record_id: Uuid) -> MatchResult<Vec<AuditNode>>;

    /// Nodes naming `node_id` as parent1 or parent2, oldest sequence first
    async fn audit_children(&self, node_id: Uuid) -> MatchResult<Vec<AuditNode>>;

    // Entities and views

    async fn get_entity(&self, id: Uuid) -> MatchResult<Option<CanonicalEntity>>;

    /// Inactive entities absorbed into `entity_id`
    async fn entities_merged_into(&self, entity_id: Uuid) -> MatchResult<Vec<CanonicalEntity>>;

    async fn views_for_record(&self, record_id: Uuid) -> MatchResult<Vec<View>>;

    async fn views_in_cycle(
        &self,
        organization_id: i64,
        cycle_id: Uuid,
        kind: RecordKind,
    ) -> MatchResult<Vec<View>>;

    async fn get_view(&self, entity_id: Uuid, cycle_id: Uuid) -> MatchResult<Option<View>>;

    /// Atomically fetch the view for (entity, cycle), creating it bound to
    /// `record_id` when absent. Returns the view and whether it was created.
    async fn get_or_create_view(
        &self,
        entity: &CanonicalEntity,
        cycle_id: Uuid,
        record_id: Uuid,
    ) -> MatchResult<(View, bool)>;

    // Batches

    async fn get_batch(&self, id: Uuid) -> MatchResult<Option<ImportBatch>>;

    async fn save_batch(&self, batch: &ImportBatch) -> MatchResult<()>;

    /// Take the advisory lock for `batch_id`. Succeeds when the lock is
    /// free, expired, or already held by `owner`.
    async fn try_acquire_batch_lock(
        &self,
        batch_id: Uuid,
        owner: Uuid,
        ttl: Duration,
    ) -> MatchResult<bool>;

    /// Release the lock if `owner` holds it
    async fn release_batch_lock(&self, batch_id: Uuid, owner: Uuid) -> MatchResult<()>;

    // Writes

    /// Apply every change or none
    async fn commit(&self, changes: ChangeSet) -> MatchResult<()>;
}
