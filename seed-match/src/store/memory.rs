//! In-memory state store
//!
//! Everything lives behind one `tokio::sync::RwLock`, so a commit is applied
//! under a single write guard and is atomic with respect to readers.
//! Supports simulated outages for exercising resumption paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChangeSet, RecordFilter, StateStore};
use crate::error::{MatchError, MatchResult};
use crate::models::{AuditNode, CanonicalEntity, ImportBatch, Record, RecordKind, View};

#[derive(Debug, Default)]
struct Inner {
    /// Record and its insertion position
    records: HashMap<Uuid, (u64, Record)>,
    next_position: u64,
    nodes: HashMap<Uuid, AuditNode>,
    next_sequence: i64,
    entities: HashMap<Uuid, CanonicalEntity>,
    views: HashMap<Uuid, View>,
    /// (entity, cycle) -> view id
    view_keys: HashMap<(Uuid, Uuid), Uuid>,
    batches: HashMap<Uuid, ImportBatch>,
    /// batch -> (owner, expiry)
    locks: HashMap<Uuid, (Uuid, Instant)>,
}

impl Inner {
    fn upsert_record(&mut self, record: Record) {
        match self.records.get_mut(&record.id) {
            Some((_, existing)) => *existing = record,
            None => {
                let position = self.next_position;
                self.next_position += 1;
                self.records.insert(record.id, (position, record));
            }
        }
    }

    fn insert_node(&mut self, mut node: AuditNode) {
        self.next_sequence += 1;
        node.sequence = self.next_sequence;
        self.nodes.insert(node.id, node);
    }

    fn upsert_view(&mut self, view: View) -> (View, bool) {
        let key = (view.entity_id, view.cycle_id);
        if let Some(existing_id) = self.view_keys.get(&key).copied() {
            if let Some(existing) = self.views.get_mut(&existing_id) {
                existing.rebind(view.record_id);
                return (existing.clone(), false);
            }
        }
        self.view_keys.insert(key, view.id);
        self.views.insert(view.id, view.clone());
        (view, true)
    }

    fn delete_view(&mut self, view_id: Uuid) {
        if let Some(view) = self.views.remove(&view_id) {
            self.view_keys.remove(&(view.entity_id, view.cycle_id));
        }
    }
}

/// Arena-backed [`StateStore`]
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
    /// Commits left before the store goes down; negative means unlimited
    commits_until_outage: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
            commits_until_outage: AtomicI64::new(-1),
        }
    }

    /// Simulate losing (or regaining) the store
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.commits_until_outage.store(-1, Ordering::SeqCst);
        }
    }

    /// Let `commits` more commits succeed, then fail every operation
    pub fn fail_after_commits(&self, commits: i64) {
        self.commits_until_outage.store(commits, Ordering::SeqCst);
    }

    /// Insert records directly, bypassing matching (test and ingest setup)
    pub async fn insert_records(&self, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.inner.write().await;
        for record in records {
            inner.upsert_record(record);
        }
    }

    /// Count of canonical entities, optionally only active ones
    pub async fn entity_count(&self, active_only: bool) -> usize {
        let inner = self.inner.read().await;
        inner
            .entities
            .values()
            .filter(|e| !active_only || e.active)
            .count()
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    fn check_available(&self) -> MatchResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MatchError::StoreUnavailable("memory store offline".into()))
        }
    }

    fn consume_commit_budget(&self) -> MatchResult<()> {
        let remaining = self.commits_until_outage.load(Ordering::SeqCst);
        if remaining == 0 {
            self.available.store(false, Ordering::SeqCst);
            return Err(MatchError::StoreUnavailable("memory store offline".into()));
        }
        if remaining > 0 {
            self.commits_until_outage.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_record(&self, id: Uuid) -> MatchResult<Option<Record>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner.records.get(&id).map(|(_, r)| r.clone()))
    }

    async fn find_records(&self, filter: &RecordFilter) -> MatchResult<Vec<Record>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut found: Vec<&(u64, Record)> = inner
            .records
            .values()
            .filter(|(_, r)| filter.matches(r))
            .collect();
        found.sort_by_key(|(position, _)| *position);
        Ok(found.into_iter().map(|(_, r)| r.clone()).collect())
    }

    async fn get_audit_node(&self, id: Uuid) -> MatchResult<Option<AuditNode>> {
        self.check_available()?;
        Ok(self.inner.read().await.nodes.get(&id).cloned())
    }

    async fn audit_nodes_for_record(&self, record_id: Uuid) -> MatchResult<Vec<AuditNode>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut nodes: Vec<AuditNode> = inner
            .nodes
            .values()
            .filter(|n| n.record_id == record_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.sequence);
        Ok(nodes)
    }

    async fn audit_children(&self, node_id: Uuid) -> MatchResult<Vec<AuditNode>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut nodes: Vec<AuditNode> = inner
            .nodes
            .values()
            .filter(|n| n.is_child_of(node_id))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.sequence);
        Ok(nodes)
    }

    async fn get_entity(&self, id: Uuid) -> MatchResult<Option<CanonicalEntity>> {
        self.check_available()?;
        Ok(self.inner.read().await.entities.get(&id).cloned())
    }

    async fn entities_merged_into(&self, entity_id: Uuid) -> MatchResult<Vec<CanonicalEntity>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut entities: Vec<CanonicalEntity> = inner
            .entities
            .values()
            .filter(|e| !e.active && e.merged_into == Some(entity_id))
            .cloned()
            .collect();
        entities.sort_by_key(|e| (e.updated_at, e.id));
        Ok(entities)
    }

    async fn views_for_record(&self, record_id: Uuid) -> MatchResult<Vec<View>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut views: Vec<View> = inner
            .views
            .values()
            .filter(|v| v.record_id == record_id)
            .cloned()
            .collect();
        views.sort_by_key(|v| (v.created_at, v.id));
        Ok(views)
    }

    async fn views_in_cycle(
        &self,
        organization_id: i64,
        cycle_id: Uuid,
        kind: RecordKind,
    ) -> MatchResult<Vec<View>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut views: Vec<View> = inner
            .views
            .values()
            .filter(|v| v.organization_id == organization_id && v.cycle_id == cycle_id && v.kind == kind)
            .cloned()
            .collect();
        views.sort_by_key(|v| (v.created_at, v.id));
        Ok(views)
    }

    async fn get_view(&self, entity_id: Uuid, cycle_id: Uuid) -> MatchResult<Option<View>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .view_keys
            .get(&(entity_id, cycle_id))
            .and_then(|id| inner.views.get(id))
            .cloned())
    }

    async fn get_or_create_view(
        &self,
        entity: &CanonicalEntity,
        cycle_id: Uuid,
        record_id: Uuid,
    ) -> MatchResult<(View, bool)> {
        self.check_available()?;
        let mut inner = self.inner.write().await;

        if !inner.entities.contains_key(&entity.id) {
            return Err(MatchError::NotFound(format!("entity {}", entity.id)));
        }
        if let Some(existing) = inner
            .view_keys
            .get(&(entity.id, cycle_id))
            .and_then(|id| inner.views.get(id))
        {
            return Ok((existing.clone(), false));
        }

        Ok(inner.upsert_view(View::new(entity, cycle_id, record_id)))
    }

    async fn get_batch(&self, id: Uuid) -> MatchResult<Option<ImportBatch>> {
        self.check_available()?;
        Ok(self.inner.read().await.batches.get(&id).cloned())
    }

    async fn save_batch(&self, batch: &ImportBatch) -> MatchResult<()> {
        self.check_available()?;
        self.inner.write().await.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn try_acquire_batch_lock(
        &self,
        batch_id: Uuid,
        owner: Uuid,
        ttl: Duration,
    ) -> MatchResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        if let Some((holder, expires_at)) = inner.locks.get(&batch_id) {
            if *holder != owner && *expires_at > now {
                return Ok(false);
            }
        }
        inner.locks.insert(batch_id, (owner, now + ttl));
        Ok(true)
    }

    async fn release_batch_lock(&self, batch_id: Uuid, owner: Uuid) -> MatchResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if inner.locks.get(&batch_id).map(|(holder, _)| *holder) == Some(owner) {
            inner.locks.remove(&batch_id);
        }
        Ok(())
    }

    async fn commit(&self, changes: ChangeSet) -> MatchResult<()> {
        self.check_available()?;
        self.consume_commit_budget()?;

        let mut inner = self.inner.write().await;

        // Validate before touching anything so a rejected commit changes nothing
        for view in &changes.views_upsert {
            let entity_known = inner.entities.contains_key(&view.entity_id)
                || changes.entities_upsert.iter().any(|e| e.id == view.entity_id);
            if !entity_known {
                return Err(MatchError::NotFound(format!("entity {}", view.entity_id)));
            }
        }

        for id in &changes.records_delete {
            inner.records.remove(id);
        }
        for record in changes.records_upsert {
            inner.upsert_record(record);
        }
        for id in &changes.nodes_delete {
            inner.nodes.remove(id);
        }
        for node in changes.nodes_insert {
            inner.insert_node(node);
        }
        for entity in changes.entities_upsert {
            inner.entities.insert(entity.id, entity);
        }
        for id in changes.views_delete {
            inner.delete_view(id);
        }
        for view in changes.views_upsert {
            inner.upsert_view(view);
        }

        Ok(())
    }
}
