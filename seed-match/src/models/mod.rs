//! Data models for seed-match
//!
//! - Records (property / tax lot states) and their typed field values
//! - Audit lineage nodes
//! - Canonical entities and cycle views
//! - Import batch state machine and run reports

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using
/// the given stored text for each variant.
macro_rules! impl_str_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

pub mod audit;
pub mod batch_report;
pub mod canonical;
pub mod field_value;
pub mod import_batch;
pub mod record;

pub use audit::{AuditEdge, AuditNode};
pub use batch_report::{BatchReport, ErrorSeverity, RecordError};
pub use canonical::{CanonicalEntity, View};
pub use field_value::FieldValue;
pub use import_batch::{BatchStatus, ImportBatch, StatusTransition};
pub use record::{DataState, MergeState, Record, RecordKind};
