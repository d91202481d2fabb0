//! Import batch state machine
//!
//! A batch moves through:
//! UPLOADED → MACHINE_MAPPING → MAPPED → MATCHING → COMPLETE | ERROR
//! and may be CANCELLED from any non-terminal state. A COMPLETE or ERROR
//! batch may re-enter MATCHING; re-running is idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MatchError, MatchResult};
use crate::models::{BatchReport, RecordKind};

/// Import batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// File received, nothing parsed yet
    Uploaded,
    /// Column mapping in progress
    MachineMapping,
    /// Records mapped and ready for matching
    Mapped,
    /// Matching running, or interrupted and resumable
    Matching,
    /// Matching finished
    Complete,
    /// Matching failed
    Error,
    /// Cancelled by user
    Cancelled,
}

impl_str_enum!(BatchStatus {
    Uploaded => "UPLOADED",
    MachineMapping => "MACHINE_MAPPING",
    Mapped => "MAPPED",
    Matching => "MATCHING",
    Complete => "COMPLETE",
    Error => "ERROR",
    Cancelled => "CANCELLED",
});

impl BatchStatus {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (*self, next) {
            (Uploaded, MachineMapping) => true,
            (MachineMapping, Mapped) => true,
            (Mapped, Matching) => true,
            // Resumption after a crash re-enters MATCHING
            (Matching, Matching) => true,
            (Matching, Complete) => true,
            (Complete, Matching) | (Error, Matching) => true,
            (Cancelled, _) => false,
            (Complete, Cancelled) => false,
            (_, Cancelled) => true,
            (Complete, Error) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// Whether matching may be started from this status
    pub fn can_start_matching(&self) -> bool {
        self.can_transition_to(BatchStatus::Matching)
    }
}

/// Status change record, logged on every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub batch_id: Uuid,
    pub old_status: BatchStatus,
    pub new_status: BatchStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// One import file's worth of records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: Uuid,
    pub organization_id: i64,
    /// Cycle the batch's records are matched into
    pub cycle_id: Uuid,
    pub kind: RecordKind,
    /// Uploaded file name, recorded on Import Creation / System Match nodes
    pub filename: Option<String>,
    pub status: BatchStatus,
    /// Report of the most recent matching run
    pub report: Option<BatchReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportBatch {
    /// Create a batch whose records are already mapped
    pub fn new_mapped(
        organization_id: i64,
        cycle_id: Uuid,
        kind: RecordKind,
        filename: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            cycle_id,
            kind,
            filename,
            status: BatchStatus::Mapped,
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status, rejecting illegal moves
    pub fn transition_to(&mut self, new_status: BatchStatus) -> MatchResult<StatusTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(MatchError::InvalidTransition {
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let transition = StatusTransition {
            batch_id: self.id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;
        self.updated_at = transition.transitioned_at;

        tracing::debug!(
            batch_id = %self.id,
            from = %transition.old_status,
            to = %transition.new_status,
            "Batch status transition"
        );

        Ok(transition)
    }

    /// Check if batch is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            BatchStatus::Complete | BatchStatus::Cancelled | BatchStatus::Error
        )
    }
}
