//! Audit Lineage Graph
//!
//! Append-only DAG of [`AuditNode`]s describing how every record came to
//! exist. Nodes are addressed by id through the [`StateStore`]; traversals
//! keep a visited set and a depth cap so malformed histories surface as
//! `GraphIntegrity` errors instead of hanging.
//!
//! **Operations:**
//! - `record_event`: append one node
//! - `history`: human-readable ancestry, most recent first
//! - `coparent`: records a freshly imported record was matched with
//! - `unmatch`: split a merge result back into its two branches

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{MatchError, MatchResult};
use crate::models::{AuditEdge, AuditNode, CanonicalEntity, Record, View};
use crate::store::{ChangeSet, StateStore};

/// One line of a record's history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub state_id: Uuid,
    pub record: Record,
    pub edge: AuditEdge,
    /// Import file basename, without upload temp suffix
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of `unmatch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchOutcome {
    /// Entity whose view was rolled back
    pub entity_id: Uuid,
    /// Record the view now points at (the old lineage)
    pub restored_record_id: Uuid,
    /// Entity now holding the detached branch
    pub detached_entity_id: Uuid,
    pub detached_record_id: Uuid,
    /// True when a previously absorbed entity was reactivated
    pub reactivated: bool,
    pub deleted_records: Vec<Uuid>,
    pub deleted_nodes: Vec<Uuid>,
}

/// Strip directories and the 7-character upload temp suffix
/// (`data_ab12cd3.csv` -> `data.csv`)
pub fn display_filename(path: &str) -> String {
    let base = path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path);
    let (stem, ext) = match base.rfind('.') {
        Some(dot) if dot > 0 => base.split_at(dot),
        _ => (base, ""),
    };

    if let Some((name, suffix)) = stem.rsplit_once('_') {
        if !name.is_empty() && suffix.len() == 7 && suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return format!("{}{}", name, ext);
        }
    }
    base.to_string()
}

/// Lineage operations over a state store
#[derive(Clone)]
pub struct LineageGraph {
    store: Arc<dyn StateStore>,
    max_depth: usize,
}

impl LineageGraph {
    pub fn new(store: Arc<dyn StateStore>, max_depth: usize) -> Self {
        Self { store, max_depth }
    }

    /// Build an unpersisted node after checking parent arity for `edge`
    pub fn new_event(
        record: &Record,
        parents: &[Uuid],
        edge: AuditEdge,
        import_filename: Option<String>,
    ) -> MatchResult<AuditNode> {
        if !edge.accepts_parent_count(parents.len()) {
            return Err(MatchError::Validation {
                record_id: record.id,
                message: format!(
                    "{} node cannot have {} parent(s)",
                    edge.label(),
                    parents.len()
                ),
            });
        }
        Ok(AuditNode::new(
            record.id,
            record.organization_id,
            parents,
            edge,
            import_filename,
        ))
    }

    /// Append one node for `record`; `parents` are audit node ids
    pub async fn record_event(
        &self,
        record: &Record,
        parents: &[Uuid],
        edge: AuditEdge,
        import_filename: Option<String>,
    ) -> MatchResult<AuditNode> {
        let node = Self::new_event(record, parents, edge, import_filename)?;

        for parent in parents {
            if self.store.get_audit_node(*parent).await?.is_none() {
                return Err(MatchError::NotFound(format!("audit node {}", parent)));
            }
        }

        let mut changes = ChangeSet::new();
        changes.nodes_insert.push(node.clone());
        self.store.commit(changes).await?;

        tracing::debug!(
            node_id = %node.id,
            record_id = %record.id,
            edge = %edge,
            "Recorded lineage event"
        );

        // Re-read to pick up the store-assigned sequence
        Ok(self.store.get_audit_node(node.id).await?.unwrap_or(node))
    }

    /// Most recent node describing `record_id`
    pub async fn latest_node(&self, record_id: Uuid) -> MatchResult<Option<AuditNode>> {
        Ok(self.store.audit_nodes_for_record(record_id).await?.pop())
    }

    /// Ancestry of `state_id`, most recent first, plus the master entry for
    /// `state_id` itself.
    ///
    /// Import Creation and Manual Edit ancestors end a branch. A System
    /// Match of two Import Creations (a file matching within itself) is
    /// listed as its two imports, newer first.
    pub async fn history(&self, state_id: Uuid) -> MatchResult<(Vec<HistoryEntry>, HistoryEntry)> {
        let start = self
            .latest_node(state_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("lineage for record {}", state_id)))?;
        let master = self.entry_for(&start).await?;

        let mut history = Vec::new();

        match start.edge {
            AuditEdge::ImportCreation => {
                history.push(master.clone());
            }
            AuditEdge::ManualEdit => {
                let parent = self.parent_node(&start, start.parent1).await?;
                history.push(self.entry_for(&parent).await?);
            }
            AuditEdge::SystemMatch | AuditEdge::ManualMatch | AuditEdge::MergeInMigration => {
                let mut visited = HashSet::from([start.id]);
                let mut node = start.clone();
                let mut depth = 0usize;

                while node.has_parents() {
                    depth += 1;
                    if depth > self.max_depth {
                        return Err(self.integrity(&node, "history depth cap exceeded"));
                    }

                    let mut next = None;
                    // parent2 first: it holds the more recent import
                    for parent_id in [node.parent2, node.parent1].into_iter().flatten() {
                        let parent = self.parent_node(&node, Some(parent_id)).await?;
                        if !visited.insert(parent.id) {
                            return Err(self.integrity(&parent, "cycle in lineage"));
                        }

                        if parent.edge.is_history_leaf() {
                            history.push(self.entry_for(&parent).await?);
                        } else if let Some((newer, older)) = self.self_match_imports(&parent).await? {
                            history.push(self.entry_for(&newer).await?);
                            history.push(self.entry_for(&older).await?);
                        } else {
                            // parent1 (older lineage) takes precedence over parent2
                            next = Some(parent);
                        }
                    }

                    match next {
                        Some(parent) => node = parent,
                        None => break,
                    }
                }
            }
        }

        tracing::debug!(
            state_id = %state_id,
            entries = history.len(),
            "Built record history"
        );

        Ok((history, master))
    }

    /// Records that the Import Creation of `state_id` was later matched with.
    ///
    /// Returns `([], 0)` when `state_id` has no Import Creation node (for
    /// example a merge result) or was never matched.
    pub async fn coparent(&self, state_id: Uuid) -> MatchResult<(Vec<Record>, usize)> {
        let creations: Vec<AuditNode> = self
            .store
            .audit_nodes_for_record(state_id)
            .await?
            .into_iter()
            .filter(|n| n.edge == AuditEdge::ImportCreation)
            .collect();

        let mut seen = HashSet::new();
        let mut coparents = Vec::new();

        for creation in &creations {
            for child in self.store.audit_children(creation.id).await? {
                for parent_id in child.parents() {
                    let parent = self.parent_node(&child, Some(parent_id)).await?;
                    if parent.record_id == state_id || !seen.insert(parent.record_id) {
                        continue;
                    }
                    let record = self.store.get_record(parent.record_id).await?.ok_or_else(|| {
                        self.integrity(&parent, "record of coparent node is missing")
                    })?;
                    coparents.push(record);
                }
            }
        }

        let count = coparents.len();
        Ok((coparents, count))
    }

    /// Split the merge result `merged_record_id` back into its two branches.
    ///
    /// The view is rolled back to the parent1 record. The parent2 record is
    /// bound to the entity that was absorbed when it merged, reactivated,
    /// or to a new entity when none is found. The merged record, its match
    /// node and any orphaned non-import ancestors are deleted.
    pub async fn unmatch(&self, merged_record_id: Uuid) -> MatchResult<UnmatchOutcome> {
        let merged = self
            .store
            .get_record(merged_record_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("record {}", merged_record_id)))?;

        let views = self.store.views_for_record(merged_record_id).await?;
        if views.is_empty() {
            return Err(MatchError::NotFound(format!(
                "view bound to record {}",
                merged_record_id
            )));
        }

        let record_nodes = self.store.audit_nodes_for_record(merged_record_id).await?;
        let match_node = record_nodes
            .iter()
            .rev()
            .find(|n| n.parent1.is_some() && n.parent2.is_some())
            .cloned()
            .ok_or_else(|| {
                MatchError::Conflict(format!("record {} is not a match result", merged_record_id))
            })?;

        let deleted_node_ids: HashSet<Uuid> = record_nodes.iter().map(|n| n.id).collect();
        for node in &record_nodes {
            let children = self.store.audit_children(node.id).await?;
            if children.iter().any(|c| !deleted_node_ids.contains(&c.id)) {
                return Err(MatchError::Conflict(format!(
                    "record {} has later lineage; unmatch the newest record first",
                    merged_record_id
                )));
            }
        }

        let parent1 = self.parent_node(&match_node, match_node.parent1).await?;
        let parent2 = self.parent_node(&match_node, match_node.parent2).await?;
        let restored_record_id = parent1.record_id;
        let detached_record_id = parent2.record_id;

        let mut changes = ChangeSet::new();
        let mut detached_entity: Option<(CanonicalEntity, bool)> = None;
        let entity_id = views[0].entity_id;

        for view in &views {
            let entity = self.store.get_entity(view.entity_id).await?.ok_or_else(|| {
                self.integrity(&match_node, "view references a missing entity")
            })?;

            let mut rolled_back = view.clone();
            rolled_back.rebind(restored_record_id);
            changes.upsert_view(rolled_back);

            if detached_entity.is_none() {
                let absorbed = self
                    .store
                    .entities_merged_into(entity.id)
                    .await?
                    .into_iter()
                    .rev()
                    .find(|e| e.last_record_id == Some(detached_record_id));
                detached_entity = Some(match absorbed {
                    Some(mut previous) => {
                        previous.reactivate();
                        (previous, true)
                    }
                    None => (CanonicalEntity::new(merged.kind, merged.organization_id), false),
                });
            }

            if let Some((other, _)) = &detached_entity {
                changes.upsert_view(View::new(other, view.cycle_id, detached_record_id));
            }
        }

        let (detached, reactivated) = detached_entity
            .ok_or_else(|| self.integrity(&match_node, "no view to detach from"))?;
        changes.upsert_entity(detached.clone());

        // The merged record and every node describing it go away
        let mut deleted_records = vec![merged_record_id];
        let mut deleted_nodes: Vec<Uuid> = record_nodes.iter().map(|n| n.id).collect();

        let still_bound: HashSet<Uuid> = [restored_record_id, detached_record_id].into();
        self.collect_orphans(
            vec![parent1, parent2],
            &still_bound,
            &mut deleted_nodes,
            &mut deleted_records,
        )
        .await?;

        changes.records_delete = deleted_records.clone();
        changes.nodes_delete = deleted_nodes.clone();
        self.store.commit(changes).await?;

        tracing::info!(
            merged_record_id = %merged_record_id,
            restored_record_id = %restored_record_id,
            detached_record_id = %detached_record_id,
            reactivated,
            deleted_nodes = deleted_nodes.len(),
            "Unmatched record"
        );

        Ok(UnmatchOutcome {
            entity_id,
            restored_record_id,
            detached_entity_id: detached.id,
            detached_record_id,
            reactivated,
            deleted_records,
            deleted_nodes,
        })
    }

    /// Walk up from `candidates`, collecting non-import nodes that end up
    /// with no surviving children and whose record is in no view
    async fn collect_orphans(
        &self,
        mut candidates: Vec<AuditNode>,
        still_bound: &HashSet<Uuid>,
        deleted_nodes: &mut Vec<Uuid>,
        deleted_records: &mut Vec<Uuid>,
    ) -> MatchResult<()> {
        let mut visited = HashSet::new();

        while let Some(node) = candidates.pop() {
            if !visited.insert(node.id) {
                continue;
            }
            if visited.len() > self.max_depth {
                return Err(self.integrity(&node, "orphan sweep depth cap exceeded"));
            }
            if node.edge == AuditEdge::ImportCreation || still_bound.contains(&node.record_id) {
                continue;
            }

            let children = self.store.audit_children(node.id).await?;
            if children.iter().any(|c| !deleted_nodes.contains(&c.id)) {
                continue;
            }
            if !self.store.views_for_record(node.record_id).await?.is_empty() {
                continue;
            }

            deleted_nodes.push(node.id);
            if !deleted_records.contains(&node.record_id) {
                deleted_records.push(node.record_id);
            }
            for parent_id in node.parents() {
                if let Some(parent) = self.store.get_audit_node(parent_id).await? {
                    candidates.push(parent);
                }
            }
        }

        Ok(())
    }

    /// For a System Match whose two parents are Import Creations, the
    /// (parent2, parent1) nodes
    async fn self_match_imports(
        &self,
        node: &AuditNode,
    ) -> MatchResult<Option<(AuditNode, AuditNode)>> {
        if node.edge != AuditEdge::SystemMatch {
            return Ok(None);
        }
        let (Some(p1), Some(p2)) = (node.parent1, node.parent2) else {
            return Ok(None);
        };

        let older = self.parent_node(node, Some(p1)).await?;
        let newer = self.parent_node(node, Some(p2)).await?;
        if older.edge == AuditEdge::ImportCreation && newer.edge == AuditEdge::ImportCreation {
            Ok(Some((newer, older)))
        } else {
            Ok(None)
        }
    }

    async fn parent_node(&self, child: &AuditNode, parent: Option<Uuid>) -> MatchResult<AuditNode> {
        let parent_id =
            parent.ok_or_else(|| self.integrity(child, "expected parent reference is empty"))?;
        self.store
            .get_audit_node(parent_id)
            .await?
            .ok_or_else(|| self.integrity(child, &format!("dangling parent {}", parent_id)))
    }

    async fn entry_for(&self, node: &AuditNode) -> MatchResult<HistoryEntry> {
        let record = self
            .store
            .get_record(node.record_id)
            .await?
            .ok_or_else(|| self.integrity(node, "record of node is missing"))?;

        Ok(HistoryEntry {
            state_id: node.record_id,
            record,
            edge: node.edge,
            filename: node.import_filename.as_deref().map(display_filename),
            created_at: node.created_at,
        })
    }

    fn integrity(&self, node: &AuditNode, message: &str) -> MatchError {
        tracing::error!(node_id = %node.id, record_id = %node.record_id, message, "Lineage integrity error");
        MatchError::GraphIntegrity {
            node_id: node.id,
            message: message.to_string(),
        }
    }
}
