//! Matching run results and per-record errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MatchError;
use crate::models::BatchStatus;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    /// Record skipped, run continues
    Skip,
    /// Run cannot continue
    Critical,
}

/// One failure recorded during a matching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    /// Record that caused the error (None for run-level failures)
    pub record_id: Option<Uuid>,

    /// Error code (e.g. "VALIDATION_ERROR", "STORE_UNAVAILABLE")
    pub error_code: String,

    /// Human-readable error message
    pub error_message: String,

    pub severity: ErrorSeverity,

    pub occurred_at: DateTime<Utc>,
}

impl RecordError {
    /// Record-scoped failure; the run continues
    pub fn skip(record_id: Option<Uuid>, err: &MatchError) -> Self {
        Self {
            record_id,
            error_code: err.code().to_string(),
            error_message: err.to_string(),
            severity: ErrorSeverity::Skip,
            occurred_at: Utc::now(),
        }
    }

    /// Run-level failure
    pub fn critical(err: &MatchError) -> Self {
        Self {
            record_id: None,
            error_code: err.code().to_string(),
            error_message: err.to_string(),
            severity: ErrorSeverity::Critical,
            occurred_at: Utc::now(),
        }
    }
}

/// Counts and sampled errors of one matching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,

    /// Status the batch was left in
    pub status: BatchStatus,

    /// Records loaded for matching
    pub total: usize,

    /// Records whose outcome was decided (promoted, merged, duplicate or errored)
    pub processed: usize,

    /// New records that joined an equivalence class with another record
    pub matched: usize,

    /// Pairwise merge operations performed
    pub merges: usize,

    /// Canonical entities created
    pub new_entities: usize,

    /// Records tagged as exact duplicates
    pub duplicates: usize,

    /// Records that failed; never smaller than the number of failures
    pub errored: usize,

    /// Sampled errors (capped by `error_sample_limit`)
    pub errors: Vec<RecordError>,

    /// Percentage complete (0.0 - 100.0)
    pub progress: f64,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BatchReport {
    pub fn new(batch_id: Uuid, status: BatchStatus) -> Self {
        Self {
            batch_id,
            status,
            total: 0,
            processed: 0,
            matched: 0,
            merges: 0,
            new_entities: 0,
            duplicates: 0,
            errored: 0,
            errors: Vec::new(),
            progress: 0.0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Duration in seconds, when finished
    pub fn duration_seconds(&self) -> Option<i64> {
        self.ended_at.map(|end| (end - self.started_at).num_seconds())
    }
}
