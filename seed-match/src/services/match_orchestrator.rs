//! Matching orchestrator
//!
//! Coordinates one import batch through the matching pipeline:
//!
//! 1. Acquire the batch's advisory lock
//! 2. Load mapped, unmatched records (already processed records are skipped,
//!    which makes an interrupted run resumable)
//! 3. Hash and deduplicate, also against records already bound to views
//! 4. Partition new records together with the cycle's canonical records
//! 5. Per equivalence class: merge pairwise in a fixed order, write lineage
//!    nodes, bind the result to a canonical entity, commit atomically
//! 6. Report progress after every class and store the final report
//!
//! Classes run concurrently via `futures::stream::buffer_unordered`; the only
//! shared state between them is a set of atomic counters.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MatchConfig;
use crate::error::{MatchError, MatchResult};
use crate::fusion::{self, MergePolicy};
use crate::models::{
    AuditEdge, AuditNode, BatchReport, BatchStatus, CanonicalEntity, DataState, FieldValue,
    ImportBatch, MergeState, Record, RecordError, View,
};
use crate::services::hasher;
use crate::services::lineage::LineageGraph;
use crate::services::partitioner;
use crate::services::progress::{percent_complete, ProgressSink};
use crate::store::{ChangeSet, RecordFilter, StateStore};

/// Status of a batch plus its most recent report
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub filename: Option<String>,
    pub report: Option<BatchReport>,
}

/// Result of a user-initiated match of two view records
#[derive(Debug, Clone)]
pub struct ManualMatchOutcome {
    pub merged: Record,
    pub node: AuditNode,
    /// Entity whose view now points at the merged record
    pub entity_id: Uuid,
    /// Entity deactivated by the match
    pub absorbed_entity_id: Uuid,
}

/// One equivalence class awaiting merge
struct ClassWork {
    /// Canonical records already bound to views in the batch cycle
    existing: Vec<Record>,
    /// Records of this batch, in input order
    new: Vec<Record>,
    matched_on: Vec<String>,
}

enum ClassOutcome {
    Committed,
    Skipped,
    Failed {
        record_ids: Vec<Uuid>,
        error: MatchError,
    },
    /// The run cannot continue (store unreachable, lock lost)
    Aborted(MatchError),
}

#[derive(Default)]
struct RunCounters {
    processed: AtomicUsize,
    matched: AtomicUsize,
    merges: AtomicUsize,
    new_entities: AtomicUsize,
}

/// Batch lock held by one run, renewed between classes
struct LockLease {
    batch_id: Uuid,
    owner: Uuid,
    ttl: Duration,
    started: Instant,
    /// Milliseconds after `started` of the last renewal
    renewed_ms: AtomicU64,
}

impl LockLease {
    fn new(batch_id: Uuid, owner: Uuid, ttl: Duration) -> Self {
        Self {
            batch_id,
            owner,
            ttl,
            started: Instant::now(),
            renewed_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    /// Renew once half the TTL has passed since the last renewal
    fn renewal_due(&self) -> bool {
        let half_ttl = (self.ttl.as_millis() / 2).min(u64::MAX as u128) as u64;
        self.elapsed_ms()
            .saturating_sub(self.renewed_ms.load(Ordering::Relaxed))
            >= half_ttl
    }

    /// Re-acquire with the same owner; `Conflict` when another matcher took it
    async fn renew(&self, store: &dyn StateStore) -> MatchResult<()> {
        if !self.renewal_due() {
            return Ok(());
        }
        let now_ms = self.elapsed_ms();
        if !store
            .try_acquire_batch_lock(self.batch_id, self.owner, self.ttl)
            .await?
        {
            return Err(MatchError::Conflict(format!(
                "batch lock for {} was taken over by another matcher",
                self.batch_id
            )));
        }
        self.renewed_ms.store(now_ms, Ordering::Relaxed);
        tracing::trace!(batch_id = %self.batch_id, "Batch lock renewed");
        Ok(())
    }
}

/// Matching orchestrator service
#[derive(Clone)]
pub struct MatchOrchestrator {
    store: Arc<dyn StateStore>,
    progress: Arc<dyn ProgressSink>,
    config: Arc<MatchConfig>,
    lineage: LineageGraph,
    policy: Arc<MergePolicy>,
}

impl MatchOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        progress: Arc<dyn ProgressSink>,
        config: MatchConfig,
    ) -> Self {
        let lineage = LineageGraph::new(store.clone(), config.matching.max_history_depth);
        let policy = Arc::new(config.merge_policy());
        Self {
            store,
            progress,
            config: Arc::new(config),
            lineage,
            policy,
        }
    }

    /// Lineage operations (history, coparent, unmatch) over the same store
    pub fn lineage(&self) -> &LineageGraph {
        &self.lineage
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Match every ready record of `batch_id`
    ///
    /// Returns `Conflict` when another matcher holds the batch lock. A store
    /// failure stops the run and leaves the batch in `Matching`; calling
    /// again resumes where the failed run stopped.
    pub async fn run_match(
        &self,
        batch_id: Uuid,
        cancel_token: &CancellationToken,
    ) -> MatchResult<BatchReport> {
        let owner = Uuid::new_v4();
        let acquired = self
            .store
            .try_acquire_batch_lock(batch_id, owner, self.config.matching.lock_ttl())
            .await?;
        if !acquired {
            return Err(MatchError::Conflict(format!(
                "matching already running for batch {}",
                batch_id
            )));
        }

        let lease = LockLease::new(batch_id, owner, self.config.matching.lock_ttl());
        let result = self.run_locked(batch_id, &lease, cancel_token).await;

        if let Err(e) = self.store.release_batch_lock(batch_id, owner).await {
            tracing::warn!(batch_id = %batch_id, error = %e, "Failed to release batch lock");
        }
        result
    }

    async fn run_locked(
        &self,
        batch_id: Uuid,
        lease: &LockLease,
        cancel_token: &CancellationToken,
    ) -> MatchResult<BatchReport> {
        let mut batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("import batch {}", batch_id)))?;

        batch.transition_to(BatchStatus::Matching)?;
        self.store.save_batch(&batch).await?;

        let mut report = BatchReport::new(batch_id, BatchStatus::Matching);
        let sample_limit = self.config.matching.error_sample_limit;
        self.publish_progress(batch_id, 0.0).await;

        let records = self
            .store
            .find_records(&RecordFilter::ready_for_matching(batch_id))
            .await?;
        report.total = records.len();

        tracing::info!(
            batch_id = %batch_id,
            record_count = records.len(),
            organization_id = batch.organization_id,
            kind = %batch.kind,
            "Matching batch"
        );

        // Existing canonical records of the cycle
        let views = self
            .store
            .views_in_cycle(batch.organization_id, batch.cycle_id, batch.kind)
            .await?;
        let mut existing = Vec::with_capacity(views.len());
        let mut view_by_record = HashMap::with_capacity(views.len());
        for view in views {
            match self.store.get_record(view.record_id).await? {
                Some(record) => {
                    existing.push(record);
                    view_by_record.insert(view.record_id, view);
                }
                None => tracing::warn!(
                    view_id = %view.id,
                    record_id = %view.record_id,
                    "View points at a missing record, ignoring"
                ),
            }
        }

        // Dedup within the batch, then against canonical records
        let dedup = hasher::filter_duplicates(records);
        for (record, error) in &dedup.errored {
            tracing::warn!(record_id = %record.id, error = %error, "Record cannot be hashed, skipping");
            push_error(&mut report, sample_limit, RecordError::skip(Some(record.id), error));
            report.processed += 1;
        }

        let existing_hashes: HashSet<String> = existing
            .iter()
            .filter_map(|r| r.hash.clone().or_else(|| hasher::compute_hash(r).ok()))
            .collect();

        let mut duplicate_changes = ChangeSet::new();
        let mut unique = Vec::with_capacity(dedup.unique.len());
        for group in dedup.duplicate_groups {
            for record in group.duplicates {
                duplicate_changes.upsert_record(mark_duplicate(record));
            }
        }
        for record in dedup.unique {
            let known = record
                .hash
                .as_ref()
                .map_or(false, |h| existing_hashes.contains(h));
            if known {
                tracing::debug!(record_id = %record.id, "Record duplicates a canonical record");
                duplicate_changes.upsert_record(mark_duplicate(record));
            } else {
                unique.push(record);
            }
        }

        report.duplicates = duplicate_changes.records_upsert.len();
        report.processed += report.duplicates;
        if !duplicate_changes.is_empty() {
            self.store.commit(duplicate_changes).await?;
        }

        let work = self.plan_classes(&batch, existing, unique);
        let total_classes = work.len();

        tracing::debug!(
            batch_id = %batch_id,
            classes = total_classes,
            "Partitioned batch into equivalence classes"
        );

        // Atomic run counters, shared by the class workers
        let counters = RunCounters::default();
        let stop = cancel_token.child_token();

        let counters_ref = &counters;
        let stop_ref = &stop;
        let batch_ref = &batch;
        let views_ref = &view_by_record;

        let mut classes = stream::iter(work)
            .map(|class| async move {
                // Check cancellation before processing
                if stop_ref.is_cancelled() {
                    return ClassOutcome::Skipped;
                }
                match self.cancelled_in_store(batch_ref.id).await {
                    Ok(false) => {}
                    Ok(true) => {
                        stop_ref.cancel();
                        return ClassOutcome::Skipped;
                    }
                    Err(error) => {
                        stop_ref.cancel();
                        return ClassOutcome::Aborted(error);
                    }
                }
                if let Err(error) = lease.renew(self.store.as_ref()).await {
                    stop_ref.cancel();
                    return ClassOutcome::Aborted(error);
                }

                let record_ids: Vec<Uuid> = class.new.iter().map(|r| r.id).collect();
                match self
                    .process_class(batch_ref, class, views_ref, counters_ref)
                    .await
                {
                    Ok(()) => ClassOutcome::Committed,
                    Err(error) => {
                        if error.is_fatal() {
                            stop_ref.cancel();
                        }
                        ClassOutcome::Failed { record_ids, error }
                    }
                }
            })
            .buffer_unordered(self.config.matching.workers);

        // Progress is published here, one finished class at a time, so the
        // reported value never moves backwards
        let mut outcomes = Vec::with_capacity(total_classes);
        let mut classes_done = 0;
        while let Some(outcome) = classes.next().await {
            if matches!(outcome, ClassOutcome::Committed | ClassOutcome::Failed { .. }) {
                classes_done += 1;
                self.publish_progress(batch_id, percent_complete(classes_done, total_classes))
                    .await;
            }
            outcomes.push(outcome);
        }
        drop(classes);

        report.processed += counters.processed.load(Ordering::Relaxed);
        report.matched = counters.matched.load(Ordering::Relaxed);
        report.merges = counters.merges.load(Ordering::Relaxed);
        report.new_entities = counters.new_entities.load(Ordering::Relaxed);
        report.progress = percent_complete(classes_done, total_classes);

        let mut fatal = None;
        for outcome in outcomes {
            if let ClassOutcome::Aborted(error) = outcome {
                fatal.get_or_insert(error);
                continue;
            }
            if let ClassOutcome::Failed { record_ids, error } = outcome {
                if error.is_fatal() {
                    fatal.get_or_insert(error);
                    continue;
                }
                tracing::warn!(
                    batch_id = %batch_id,
                    records = record_ids.len(),
                    error = %error,
                    "Equivalence class failed, continuing"
                );
                report.processed += record_ids.len();
                for id in record_ids {
                    push_error(&mut report, sample_limit, RecordError::skip(Some(id), &error));
                }
            }
        }

        if let Some(error) = fatal {
            tracing::error!(
                batch_id = %batch_id,
                error = %error,
                "Matching stopped; batch left resumable"
            );
            // A lost lock means the batch now belongs to another matcher
            if !matches!(error, MatchError::Conflict(_)) {
                report.errors.push(RecordError::critical(&error));
                report.errored += 1;
                report.ended_at = Some(Utc::now());
                batch.report = Some(report);
                if let Err(e) = self.store.save_batch(&batch).await {
                    tracing::warn!(batch_id = %batch_id, error = %e, "Could not save partial report");
                }
            }
            return Err(error);
        }

        let cancelled = stop.is_cancelled() || self.cancelled_in_store(batch_id).await?;
        if cancelled {
            batch.transition_to(BatchStatus::Cancelled)?;
            tracing::info!(
                batch_id = %batch_id,
                processed = report.processed,
                "Matching cancelled"
            );
        } else {
            batch.transition_to(BatchStatus::Complete)?;
            report.progress = 100.0;
        }

        report.status = batch.status;
        report.ended_at = Some(Utc::now());
        batch.report = Some(report.clone());
        self.store.save_batch(&batch).await?;
        self.publish_progress(batch_id, report.progress).await;

        tracing::info!(
            batch_id = %batch_id,
            status = %report.status,
            total = report.total,
            matched = report.matched,
            merges = report.merges,
            new_entities = report.new_entities,
            duplicates = report.duplicates,
            errored = report.errored,
            "Matching finished"
        );

        Ok(report)
    }

    /// Partition and order the work: only classes holding at least one new
    /// record need anything done
    fn plan_classes(
        &self,
        batch: &ImportBatch,
        existing: Vec<Record>,
        unique: Vec<Record>,
    ) -> Vec<ClassWork> {
        let existing_count = existing.len();
        let mut candidates = existing;
        candidates.extend(unique);

        let classes = partitioner::partition(&candidates, self.config.rules_for(batch.kind));

        classes
            .into_iter()
            .filter(|class| class.indices.iter().any(|&i| i >= existing_count))
            .map(|class| {
                let mut existing = Vec::new();
                let mut new = Vec::new();
                for &i in &class.indices {
                    if i < existing_count {
                        existing.push(candidates[i].clone());
                    } else {
                        new.push(candidates[i].clone());
                    }
                }
                existing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                // Stable: equal timestamps keep input order
                new.sort_by(|a, b| a.created_at.cmp(&b.created_at));

                ClassWork {
                    existing,
                    new,
                    matched_on: class.matched_on,
                }
            })
            .collect()
    }

    /// Merge one class and commit it atomically
    async fn process_class(
        &self,
        batch: &ImportBatch,
        class: ClassWork,
        views: &HashMap<Uuid, View>,
        counters: &RunCounters,
    ) -> MatchResult<()> {
        let filename = batch.filename.clone();
        let mut changes = ChangeSet::new();
        let new_count = class.new.len();
        let is_singleton = class.existing.is_empty() && new_count == 1;

        // Lineage tips, in merge order
        let mut members = Vec::with_capacity(class.existing.len() + new_count);
        for record in class.existing.iter() {
            let node_id = self.ensure_node(record, None, &mut changes).await?;
            members.push((record.clone(), node_id));
        }
        for record in class.new {
            let node_id = self
                .ensure_node(&record, filename.clone(), &mut changes)
                .await?;
            let mut processed = record;
            processed.data_state = DataState::Matching;
            processed.merge_state = if is_singleton {
                MergeState::New
            } else {
                MergeState::Merged
            };
            processed.updated_at = Utc::now();
            changes.upsert_record(processed.clone());
            members.push((processed, node_id));
        }

        let mut iter = members.into_iter();
        let (mut current, mut current_node) = iter
            .next()
            .ok_or_else(|| MatchError::Conflict("empty equivalence class".to_string()))?;

        let mut merges = 0;
        for (next, next_node) in iter {
            let outcome = fusion::merge(&current, &next, &self.policy)?;
            let node = LineageGraph::new_event(
                &outcome.merged,
                &[current_node, next_node],
                AuditEdge::SystemMatch,
                filename.clone(),
            )?;
            current_node = node.id;
            changes.nodes_insert.push(node);
            changes.upsert_record(outcome.merged.clone());
            current = outcome.merged;
            merges += 1;
        }

        // Bind the result to the base entity; absorb the other canonical members
        let mut created_entity = false;
        match class.existing.first() {
            Some(base_record) => {
                let base_view = views.get(&base_record.id).ok_or_else(|| {
                    MatchError::NotFound(format!("view for record {}", base_record.id))
                })?;

                for other in class.existing.iter().skip(1) {
                    let view = views.get(&other.id).ok_or_else(|| {
                        MatchError::NotFound(format!("view for record {}", other.id))
                    })?;
                    let mut entity = self
                        .store
                        .get_entity(view.entity_id)
                        .await?
                        .ok_or_else(|| MatchError::NotFound(format!("entity {}", view.entity_id)))?;
                    entity.deactivate(base_view.entity_id, other.id);
                    changes.upsert_entity(entity);
                    changes.views_delete.push(view.id);
                }

                if current.id != base_record.id {
                    let mut view = base_view.clone();
                    view.rebind(current.id);
                    changes.upsert_view(view);
                }
            }
            None => {
                let entity = CanonicalEntity::new(current.kind, current.organization_id);
                changes.upsert_view(View::new(&entity, batch.cycle_id, current.id));
                changes.upsert_entity(entity);
                created_entity = true;
            }
        }

        self.store.commit(changes).await?;

        tracing::debug!(
            batch_id = %batch.id,
            record_id = %current.id,
            new_members = new_count,
            existing_members = class.existing.len(),
            merges,
            matched_on = ?class.matched_on,
            "Committed equivalence class"
        );

        counters.processed.fetch_add(new_count, Ordering::Relaxed);
        counters.merges.fetch_add(merges, Ordering::Relaxed);
        if !is_singleton {
            counters.matched.fetch_add(new_count, Ordering::Relaxed);
        }
        if created_entity {
            counters.new_entities.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Latest lineage node of `record`, queueing an Import Creation node
    /// when it has none
    async fn ensure_node(
        &self,
        record: &Record,
        filename: Option<String>,
        changes: &mut ChangeSet,
    ) -> MatchResult<Uuid> {
        if let Some(node) = self.lineage.latest_node(record.id).await? {
            return Ok(node.id);
        }
        let node = LineageGraph::new_event(record, &[], AuditEdge::ImportCreation, filename)?;
        let id = node.id;
        changes.nodes_insert.push(node);
        Ok(id)
    }

    async fn cancelled_in_store(&self, batch_id: Uuid) -> MatchResult<bool> {
        Ok(matches!(
            self.store.get_batch(batch_id).await?,
            Some(batch) if batch.status == BatchStatus::Cancelled
        ))
    }

    async fn publish_progress(&self, batch_id: Uuid, percent: f64) {
        if let Err(e) = self
            .progress
            .set_progress(batch_id, percent, self.config.matching.progress_ttl())
            .await
        {
            tracing::warn!(batch_id = %batch_id, error = %e, "Progress update failed");
        }
    }

    /// Merge two records bound to views of `cycle_id` on user request.
    ///
    /// `record_b`'s entity is absorbed into `record_a`'s; the merged record
    /// replaces `record_a` in its view.
    pub async fn manual_match(
        &self,
        record_a: Uuid,
        record_b: Uuid,
        cycle_id: Uuid,
    ) -> MatchResult<ManualMatchOutcome> {
        if record_a == record_b {
            return Err(MatchError::Conflict(format!(
                "record {} cannot be matched with itself",
                record_a
            )));
        }

        let a = self.require_record(record_a).await?;
        let b = self.require_record(record_b).await?;
        let view_a = self.require_view(record_a, cycle_id).await?;
        let view_b = self.require_view(record_b, cycle_id).await?;
        if view_a.entity_id == view_b.entity_id {
            return Err(MatchError::Conflict(format!(
                "records {} and {} already belong to entity {}",
                record_a, record_b, view_a.entity_id
            )));
        }

        let outcome = fusion::merge(&a, &b, &self.policy)?;

        let mut changes = ChangeSet::new();
        let node_a = self.ensure_node(&a, None, &mut changes).await?;
        let node_b = self.ensure_node(&b, None, &mut changes).await?;
        let node = LineageGraph::new_event(
            &outcome.merged,
            &[node_a, node_b],
            AuditEdge::ManualMatch,
            None,
        )?;
        changes.nodes_insert.push(node.clone());
        changes.upsert_record(outcome.merged.clone());

        let mut absorbed = self
            .store
            .get_entity(view_b.entity_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("entity {}", view_b.entity_id)))?;
        absorbed.deactivate(view_a.entity_id, record_b);
        changes.upsert_entity(absorbed.clone());
        changes.views_delete.push(view_b.id);

        let mut view = view_a.clone();
        view.rebind(outcome.merged.id);
        changes.upsert_view(view);

        self.store.commit(changes).await?;

        tracing::info!(
            record_a = %record_a,
            record_b = %record_b,
            merged_record_id = %outcome.merged.id,
            entity_id = %view_a.entity_id,
            "Manual match"
        );

        Ok(ManualMatchOutcome {
            merged: outcome.merged,
            node,
            entity_id: view_a.entity_id,
            absorbed_entity_id: absorbed.id,
        })
    }

    /// Create a new version of `record_id` with `edits` applied and point
    /// every view of the old version at it.
    ///
    /// Keys already present in extra data are edited there; anything else is
    /// a typed field. An empty value removes the key.
    pub async fn manual_edit(
        &self,
        record_id: Uuid,
        edits: BTreeMap<String, FieldValue>,
    ) -> MatchResult<Record> {
        let original = self.require_record(record_id).await?;

        let mut edited = original.clone();
        edited.id = Uuid::new_v4();
        for (key, value) in edits {
            let target = if edited.extra_data.contains_key(&key) {
                &mut edited.extra_data
            } else {
                &mut edited.fields
            };
            if value.is_empty() {
                target.remove(&key);
            } else {
                target.insert(key, value);
            }
        }
        let now = Utc::now();
        edited.created_at = now;
        edited.updated_at = now;
        edited.rehash()?;

        let mut changes = ChangeSet::new();
        let parent = self.ensure_node(&original, None, &mut changes).await?;
        let node = LineageGraph::new_event(&edited, &[parent], AuditEdge::ManualEdit, None)?;
        changes.nodes_insert.push(node);
        changes.upsert_record(edited.clone());

        for mut view in self.store.views_for_record(record_id).await? {
            view.rebind(edited.id);
            changes.upsert_view(view);
        }

        self.store.commit(changes).await?;

        tracing::info!(
            record_id = %record_id,
            edited_record_id = %edited.id,
            "Manual edit"
        );
        Ok(edited)
    }

    pub async fn batch_status(&self, batch_id: Uuid) -> MatchResult<BatchSummary> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("import batch {}", batch_id)))?;
        Ok(BatchSummary {
            batch_id: batch.id,
            status: batch.status,
            filename: batch.filename,
            report: batch.report,
        })
    }

    /// Mark a batch cancelled; a running match stops before its next class
    pub async fn cancel_batch(&self, batch_id: Uuid) -> MatchResult<ImportBatch> {
        let mut batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("import batch {}", batch_id)))?;
        batch.transition_to(BatchStatus::Cancelled)?;
        self.store.save_batch(&batch).await?;

        tracing::info!(batch_id = %batch_id, "Batch cancelled");
        Ok(batch)
    }

    async fn require_record(&self, id: Uuid) -> MatchResult<Record> {
        self.store
            .get_record(id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("record {}", id)))
    }

    async fn require_view(&self, record_id: Uuid, cycle_id: Uuid) -> MatchResult<View> {
        self.store
            .views_for_record(record_id)
            .await?
            .into_iter()
            .find(|v| v.cycle_id == cycle_id)
            .ok_or_else(|| {
                MatchError::NotFound(format!("view of record {} in cycle {}", record_id, cycle_id))
            })
    }
}

fn mark_duplicate(mut record: Record) -> Record {
    record.merge_state = MergeState::Duplicate;
    record.data_state = DataState::Matching;
    record.updated_at = Utc::now();
    record
}

fn push_error(report: &mut BatchReport, limit: usize, error: RecordError) {
    report.errored += 1;
    if report.errors.len() < limit {
        report.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use crate::services::progress::MemoryProgressCache;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        progress: Arc<MemoryProgressCache>,
        orchestrator: MatchOrchestrator,
        batch: ImportBatch,
    }

    async fn fixture(rows: &[(&str, &str)]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let progress = Arc::new(MemoryProgressCache::new());
        let batch = ImportBatch::new_mapped(
            1,
            Uuid::new_v4(),
            RecordKind::Property,
            Some("/tmp/upload/buildings_ab12cd3.csv".into()),
        );
        store.save_batch(&batch).await.unwrap();

        let records = rows.iter().map(|(field, value)| {
            let mut r = Record::new(RecordKind::Property, 1)
                .in_batch(batch.id)
                .with_field(field, *value);
            r.rehash().unwrap();
            r
        });
        store.insert_records(records).await;

        let orchestrator =
            MatchOrchestrator::new(store.clone(), progress.clone(), MatchConfig::default());
        Fixture {
            store,
            progress,
            orchestrator,
            batch,
        }
    }

    #[tokio::test]
    async fn test_singletons_promoted() {
        let f = fixture(&[("pm_property_id", "1"), ("pm_property_id", "2")]).await;
        let report = f
            .orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, BatchStatus::Complete);
        assert_eq!(report.new_entities, 2);
        assert_eq!(report.merges, 0);
        assert_eq!(report.processed, 2);
        assert_eq!(f.store.entity_count(true).await, 2);
        assert_eq!(f.progress.get(f.batch.id).await, Some(100.0));

        let promoted = f
            .store
            .find_records(&RecordFilter::in_batch(f.batch.id).merge_state(MergeState::New))
            .await
            .unwrap();
        assert_eq!(promoted.len(), 2);
    }

    #[tokio::test]
    async fn test_class_merged_with_lineage() {
        let f = fixture(&[("pm_property_id", "7"), ("pm_property_id", "7 ")]).await;
        // Make the rows differ so they are not exact duplicates
        let mut rows = f
            .store
            .find_records(&RecordFilter::in_batch(f.batch.id))
            .await
            .unwrap();
        let mut second = rows.remove(1);
        second.set_field("address_line_1", "1 Main St").unwrap();
        let mut changes = ChangeSet::new();
        changes.upsert_record(second);
        f.store.commit(changes).await.unwrap();

        let report = f
            .orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.matched, 2);
        assert_eq!(report.merges, 1);
        assert_eq!(report.new_entities, 1);
        // Two Import Creation nodes plus one System Match
        assert_eq!(f.store.node_count().await, 3);

        let merged = f
            .store
            .find_records(&RecordFilter::default().merge_state(MergeState::Merged))
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.data_state == DataState::Merged)
            .unwrap();
        let node = f.orchestrator.lineage().latest_node(merged.id).await.unwrap().unwrap();
        assert_eq!(node.edge, AuditEdge::SystemMatch);
        assert_eq!(
            node.import_filename.as_deref(),
            Some("/tmp/upload/buildings_ab12cd3.csv")
        );
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let f = fixture(&[("pm_property_id", "1"), ("ubid", "X")]).await;
        let token = CancellationToken::new();
        f.orchestrator.run_match(f.batch.id, &token).await.unwrap();
        let entities = f.store.entity_count(false).await;

        let report = f.orchestrator.run_match(f.batch.id, &token).await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.new_entities, 0);
        assert_eq!(f.store.entity_count(false).await, entities);
    }

    #[tokio::test]
    async fn test_lock_held_is_conflict() {
        let f = fixture(&[("pm_property_id", "1")]).await;
        f.store
            .try_acquire_batch_lock(f.batch.id, Uuid::new_v4(), std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let err = f
            .orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_classes() {
        let f = fixture(&[("pm_property_id", "1"), ("pm_property_id", "2")]).await;
        let token = CancellationToken::new();
        token.cancel();

        let report = f.orchestrator.run_match(f.batch.id, &token).await.unwrap();
        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.new_entities, 0);
        assert_eq!(f.store.entity_count(false).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_batch_blocks_matching() {
        let f = fixture(&[("pm_property_id", "1")]).await;
        let cancelled = f.orchestrator.cancel_batch(f.batch.id).await.unwrap();
        assert_eq!(cancelled.status, BatchStatus::Cancelled);

        let err = f
            .orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidTransition { .. }));

        let summary = f.orchestrator.batch_status(f.batch.id).await.unwrap();
        assert_eq!(summary.status, BatchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_batch_not_found() {
        let f = fixture(&[]).await;
        let err = f
            .orchestrator
            .run_match(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::NotFound(_)));
    }

    /// Sink that keeps every published value
    #[derive(Default)]
    struct RecordingSink {
        values: std::sync::Mutex<Vec<f64>>,
    }

    #[async_trait::async_trait]
    impl ProgressSink for RecordingSink {
        async fn set_progress(&self, _batch_id: Uuid, percent: f64, _ttl: Duration) -> MatchResult<()> {
            tokio::task::yield_now().await;
            self.values.lock().unwrap().push(percent);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_progress_never_moves_backwards() {
        let rows: Vec<(&str, String)> = (0..12).map(|i| ("pm_property_id", i.to_string())).collect();
        let borrowed: Vec<(&str, &str)> = rows.iter().map(|(f, v)| (*f, v.as_str())).collect();
        let f = fixture(&borrowed).await;

        let sink = Arc::new(RecordingSink::default());
        let mut config = MatchConfig::default();
        config.matching.workers = 4;
        let orchestrator = MatchOrchestrator::new(f.store.clone(), sink.clone(), config);

        let report = orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.new_entities, 12);

        let values = sink.values.lock().unwrap().clone();
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "{:?}", values);
        assert_eq!(values.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_lock_lease_renews_only_when_due() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        assert!(store
            .try_acquire_batch_lock(batch_id, owner, Duration::from_secs(3600))
            .await
            .unwrap());

        // Fresh lease with a long TTL: nothing to do even if another owner
        // appears later
        let lease = LockLease::new(batch_id, owner, Duration::from_secs(3600));
        assert!(!lease.renewal_due());
        lease.renew(&store).await.unwrap();

        // Zero TTL: always due; a competing owner makes renewal a conflict
        let lease = LockLease::new(batch_id, owner, Duration::ZERO);
        assert!(lease.renewal_due());
        lease.renew(&store).await.unwrap();
        assert!(store
            .try_acquire_batch_lock(batch_id, Uuid::new_v4(), Duration::from_secs(3600))
            .await
            .unwrap());
        assert!(matches!(lease.renew(&store).await, Err(MatchError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_manual_edit_creates_version() {
        let f = fixture(&[("pm_property_id", "1")]).await;
        f.orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap();
        let original = f
            .store
            .find_records(&RecordFilter::in_batch(f.batch.id))
            .await
            .unwrap()
            .remove(0);

        let mut edits = BTreeMap::new();
        edits.insert("property_name".to_string(), FieldValue::from("Tower"));
        let edited = f.orchestrator.manual_edit(original.id, edits).await.unwrap();

        assert_ne!(edited.id, original.id);
        assert_ne!(edited.hash, original.hash);
        let views = f.store.views_for_record(edited.id).await.unwrap();
        assert_eq!(views.len(), 1);

        let node = f.orchestrator.lineage().latest_node(edited.id).await.unwrap().unwrap();
        assert_eq!(node.edge, AuditEdge::ManualEdit);
        assert!(node.parent2.is_none());
    }

    #[tokio::test]
    async fn test_manual_match_absorbs_entity() {
        let f = fixture(&[("pm_property_id", "1"), ("pm_property_id", "2")]).await;
        f.orchestrator
            .run_match(f.batch.id, &CancellationToken::new())
            .await
            .unwrap();
        let records = f
            .store
            .find_records(&RecordFilter::in_batch(f.batch.id))
            .await
            .unwrap();

        let outcome = f
            .orchestrator
            .manual_match(records[0].id, records[1].id, f.batch.cycle_id)
            .await
            .unwrap();

        assert_eq!(outcome.node.edge, AuditEdge::ManualMatch);
        assert_eq!(f.store.entity_count(true).await, 1);
        let absorbed = f.store.get_entity(outcome.absorbed_entity_id).await.unwrap().unwrap();
        assert_eq!(absorbed.merged_into, Some(outcome.entity_id));

        let err = f
            .orchestrator
            .manual_match(records[0].id, records[0].id, f.batch.cycle_id)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Conflict(_)));
    }
}
