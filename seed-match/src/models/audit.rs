//! Audit lineage nodes
//!
//! Each node records how one record came to exist. Nodes form an
//! append-only DAG through their `parent1`/`parent2` references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Edge label of an audit node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEdge {
    #[serde(rename = "Import Creation")]
    ImportCreation,
    #[serde(rename = "System Match")]
    SystemMatch,
    #[serde(rename = "Manual Match")]
    ManualMatch,
    #[serde(rename = "Manual Edit")]
    ManualEdit,
    #[serde(rename = "Merge current state in migration")]
    MergeInMigration,
}

impl AuditEdge {
    pub fn label(&self) -> &'static str {
        match self {
            AuditEdge::ImportCreation => "Import Creation",
            AuditEdge::SystemMatch => "System Match",
            AuditEdge::ManualMatch => "Manual Match",
            AuditEdge::ManualEdit => "Manual Edit",
            AuditEdge::MergeInMigration => "Merge current state in migration",
        }
    }

    /// Import Creation and Manual Edit nodes end a history walk
    pub fn is_history_leaf(&self) -> bool {
        matches!(self, AuditEdge::ImportCreation | AuditEdge::ManualEdit)
    }

    /// Whether `count` parents is legal for this edge
    pub fn accepts_parent_count(&self, count: usize) -> bool {
        match self {
            AuditEdge::ImportCreation => count == 0,
            AuditEdge::ManualEdit => count == 1,
            AuditEdge::SystemMatch | AuditEdge::ManualMatch | AuditEdge::MergeInMigration => {
                count == 0 || count == 2
            }
        }
    }
}

impl fmt::Display for AuditEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AuditEdge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Import Creation" => Ok(AuditEdge::ImportCreation),
            "System Match" => Ok(AuditEdge::SystemMatch),
            "Manual Match" => Ok(AuditEdge::ManualMatch),
            "Manual Edit" => Ok(AuditEdge::ManualEdit),
            "Merge current state in migration" => Ok(AuditEdge::MergeInMigration),
            other => Err(format!("unknown audit edge: {}", other)),
        }
    }
}

/// One immutable entry in the lineage graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditNode {
    pub id: Uuid,
    /// Store-assigned insertion order; 0 until persisted
    pub sequence: i64,
    /// Record this node describes
    pub record_id: Uuid,
    pub parent1: Option<Uuid>,
    pub parent2: Option<Uuid>,
    pub edge: AuditEdge,
    pub import_filename: Option<String>,
    pub organization_id: i64,
    pub created_at: DateTime<Utc>,
}

impl AuditNode {
    /// Build an unpersisted node
    pub fn new(
        record_id: Uuid,
        organization_id: i64,
        parents: &[Uuid],
        edge: AuditEdge,
        import_filename: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            record_id,
            parent1: parents.first().copied(),
            parent2: parents.get(1).copied(),
            edge,
            import_filename,
            organization_id,
            created_at: Utc::now(),
        }
    }

    /// Parent ids in (parent1, parent2) order
    pub fn parents(&self) -> impl Iterator<Item = Uuid> {
        self.parent1.into_iter().chain(self.parent2)
    }

    pub fn has_parents(&self) -> bool {
        self.parent1.is_some() || self.parent2.is_some()
    }

    /// True when `node_id` is one of this node's parents
    pub fn is_child_of(&self, node_id: Uuid) -> bool {
        self.parent1 == Some(node_id) || self.parent2 == Some(node_id)
    }
}
