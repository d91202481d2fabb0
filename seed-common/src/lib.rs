//! # SEED Common Library
//!
//! Shared code for the SEED matching workspace:
//! - Error type used by the database and configuration layers
//! - Configuration file resolution and TOML loading
//! - SQLite database initialization (schema for states, lineage, views)

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;

pub use error::{Error, Result};
