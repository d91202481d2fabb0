// Fusion Module - combining record versions
//
// record_merger: field-wise precedence and provenance
// footprint: geometry field / invalid companion pairing

pub mod footprint;
pub mod record_merger;

pub use record_merger::{merge, FieldOverride, MergeOutcome, MergePolicy, Provenance, Side};
