//! Service modules for the matching pipeline
//!
//! Leaves first: hashing/dedup, partitioning, lineage, progress, and the
//! orchestrator that drives a batch through all of them.

pub mod hasher;
pub mod lineage;
pub mod match_orchestrator;
pub mod partitioner;
pub mod progress;

pub use hasher::{compute_hash, filter_duplicates, DedupOutcome, DuplicateGroup};
pub use lineage::{display_filename, HistoryEntry, LineageGraph, UnmatchOutcome};
pub use match_orchestrator::{BatchSummary, ManualMatchOutcome, MatchOrchestrator};
pub use partitioner::{partition, DisjointSet, EquivalenceClass, EquivalenceRule};
pub use progress::{percent_complete, MemoryProgressCache, ProgressSink};
