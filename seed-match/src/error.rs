//! Error types for seed-match
//!
//! Errors fall into three groups:
//! - record-scoped (`Validation`): logged, counted, processing continues
//! - request-scoped (`NotFound`, `Conflict`, `GraphIntegrity`): surfaced to
//!   the caller, never a crash
//! - fatal (`StoreUnavailable`, `CrossOrganization`, `Configuration`): the
//!   run stops; the batch is left in a resumable state

use thiserror::Error;
use uuid::Uuid;

/// Matching engine error
#[derive(Debug, Error)]
pub enum MatchError {
    /// Malformed or unhashable record data
    #[error("Invalid record {record_id}: {message}")]
    Validation { record_id: Uuid, message: String },

    /// Lookup of a record, node, entity, view or batch that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Competing operation (e.g. matching already running for the batch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Corrupted lineage: cycle, dangling parent or depth cap exceeded
    #[error("Lineage integrity error at node {node_id}: {message}")]
    GraphIntegrity { node_id: Uuid, message: String },

    /// Persistent store unreachable or failing
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Attempt to merge records owned by different organizations or kinds
    #[error("Cannot merge record {left} with record {right}: {reason}")]
    CrossOrganization {
        left: Uuid,
        right: Uuid,
        reason: String,
    },

    /// Batch status machine misuse
    #[error("Invalid batch transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Bad rule set or merge override configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Shared layer error
    #[error("Common error: {0}")]
    Common(seed_common::Error),
}

impl MatchError {
    /// Errors that must stop the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MatchError::StoreUnavailable(_)
                | MatchError::CrossOrganization { .. }
                | MatchError::Configuration(_)
        )
    }

    /// Errors attributable to a single record; the batch continues
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, MatchError::Validation { .. })
    }

    /// Short machine-readable code for batch error reports
    pub fn code(&self) -> &'static str {
        match self {
            MatchError::Validation { .. } => "VALIDATION_ERROR",
            MatchError::NotFound(_) => "NOT_FOUND",
            MatchError::Conflict(_) => "CONFLICT",
            MatchError::GraphIntegrity { .. } => "GRAPH_INTEGRITY",
            MatchError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            MatchError::CrossOrganization { .. } => "CROSS_ORGANIZATION",
            MatchError::InvalidTransition { .. } => "INVALID_TRANSITION",
            MatchError::Configuration(_) => "CONFIGURATION_ERROR",
            MatchError::Common(_) => "COMMON_ERROR",
        }
    }
}

impl From<seed_common::Error> for MatchError {
    fn from(err: seed_common::Error) -> Self {
        if err.is_store_failure() {
            MatchError::StoreUnavailable(err.to_string())
        } else {
            MatchError::Common(err)
        }
    }
}

impl From<serde_json::Error> for MatchError {
    fn from(err: serde_json::Error) -> Self {
        MatchError::Common(seed_common::Error::Serialization(err))
    }
}

impl From<sqlx::Error> for MatchError {
    fn from(err: sqlx::Error) -> Self {
        MatchError::StoreUnavailable(err.to_string())
    }
}

/// Result type for matching operations
pub type MatchResult<T> = Result<T, MatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        let validation = MatchError::Validation {
            record_id: Uuid::new_v4(),
            message: "bad".into(),
        };
        assert!(validation.is_record_scoped());
        assert!(!validation.is_fatal());

        let store = MatchError::StoreUnavailable("gone".into());
        assert!(store.is_fatal());
        assert!(!store.is_record_scoped());

        assert!(!MatchError::NotFound("x".into()).is_fatal());
    }

    #[test]
    fn test_common_io_error_maps_to_store_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: MatchError = seed_common::Error::Io(io).into();
        assert!(matches!(err, MatchError::StoreUnavailable(_)));

        let cfg: MatchError = seed_common::Error::Config("bad".into()).into();
        assert!(matches!(cfg, MatchError::Common(_)));
    }
}
