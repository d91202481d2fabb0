//! Canonical entities and their per-cycle views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::RecordKind;

/// Stable cross-time identity ("Property #42")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: Uuid,
    pub kind: RecordKind,
    pub organization_id: i64,
    /// False once absorbed into another entity by a match
    pub active: bool,
    /// Entity that absorbed this one
    pub merged_into: Option<Uuid>,
    /// Record this entity's view pointed at when it was deactivated
    pub last_record_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEntity {
    pub fn new(kind: RecordKind, organization_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            organization_id,
            active: true,
            merged_into: None,
            last_record_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark absorbed by `into`, remembering the record it last pointed at
    pub fn deactivate(&mut self, into: Uuid, last_record_id: Uuid) {
        self.active = false;
        self.merged_into = Some(into);
        self.last_record_id = Some(last_record_id);
        self.updated_at = Utc::now();
    }

    pub fn reactivate(&mut self) {
        self.active = true;
        self.merged_into = None;
        self.updated_at = Utc::now();
    }
}

/// Binding of an entity to one record within one cycle.
///
/// At most one view exists per (entity, cycle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub cycle_id: Uuid,
    /// Current record of the entity in this cycle
    pub record_id: Uuid,
    pub organization_id: i64,
    pub kind: RecordKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl View {
    pub fn new(entity: &CanonicalEntity, cycle_id: Uuid, record_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id: entity.id,
            cycle_id,
            record_id,
            organization_id: entity.organization_id,
            kind: entity.kind,
            created_at: now,
            updated_at: now,
        }
    }

    /// Point the view at a different record
    pub fn rebind(&mut self, record_id: Uuid) {
        self.record_id = record_id;
        self.updated_at = Utc::now();
    }
}
