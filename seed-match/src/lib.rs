//! seed-match library interface
//!
//! Record matching, merging and state-history engine for property and tax
//! lot inventories. Exposes the orchestrator and lineage operations used by
//! the CLI and by integration tests.

pub mod config;
pub mod error;
pub mod fusion;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

pub use crate::config::MatchConfig;
pub use crate::error::{MatchError, MatchResult};
pub use crate::services::{LineageGraph, MatchOrchestrator};
pub use crate::store::{ChangeSet, MemoryStore, RecordFilter, SqliteStore, StateStore};
