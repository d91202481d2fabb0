//! Database initialization
//!
//! Creates the SQLite schema used by the matching engine: import batches,
//! record states, the audit lineage arena, canonical entities, cycle views
//! and per-batch advisory locks. Every statement is idempotent so opening an
//! existing database is safe.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version written to `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers with one writer, needed when several
    // class workers commit while status is being polled
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_schema(&pool).await?;
    apply_busy_timeout(&pool).await?;

    Ok(pool)
}

/// Initialize a private in-memory database (single connection)
pub async fn init_memory_database() -> Result<SqlitePool> {
    // One connection: every new connection to sqlite::memory: is a new database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Create every table and seed default settings
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_import_batches_table(pool).await?;
    create_states_table(pool).await?;
    create_audit_nodes_table(pool).await?;
    create_canonical_entities_table(pool).await?;
    create_views_table(pool).await?;
    create_batch_locks_table(pool).await?;

    init_default_settings(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn apply_busy_timeout(pool: &SqlitePool) -> Result<()> {
    // Short busy timeout; longer waits are handled by retry with backoff up
    // to database_max_lock_wait_ms
    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'database_lock_retry_ms'",
    )
    .fetch_optional(pool)
    .await?
    .unwrap_or(250);

    let pragma_sql = format!("PRAGMA busy_timeout = {}", timeout_ms);
    sqlx::query(&pragma_sql).execute(pool).await?;

    info!("Database busy timeout set to {} ms", timeout_ms);
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_import_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_batches (
            id TEXT PRIMARY KEY,
            organization_id INTEGER NOT NULL,
            cycle_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            filename TEXT,
            status TEXT NOT NULL,
            report TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_states_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS states (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            organization_id INTEGER NOT NULL,
            import_batch_id TEXT,
            source_type TEXT,
            data_state TEXT NOT NULL,
            merge_state TEXT NOT NULL,
            fields TEXT NOT NULL DEFAULT '{}',
            extra_data TEXT NOT NULL DEFAULT '{}',
            hash TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_states_batch_lookup
        ON states (organization_id, import_batch_id, data_state, merge_state)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_states_hash ON states (hash)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_audit_nodes_table(pool: &SqlitePool) -> Result<()> {
    // Parents are plain references: a dangling parent must be observable as
    // a lineage integrity problem rather than rejected on write
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_nodes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            record_id TEXT NOT NULL,
            parent1_id TEXT,
            parent2_id TEXT,
            edge TEXT NOT NULL,
            import_filename TEXT,
            organization_id INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_record ON audit_nodes (record_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_parent1 ON audit_nodes (parent1_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_parent2 ON audit_nodes (parent2_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_canonical_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_entities (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            organization_id INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            merged_into TEXT,
            last_record_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_views_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS views (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL REFERENCES canonical_entities(id) ON DELETE CASCADE,
            cycle_id TEXT NOT NULL,
            record_id TEXT NOT NULL,
            organization_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (entity_id, cycle_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_views_record ON views (record_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_views_cycle ON views (organization_id, cycle_id, kind)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_batch_locks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_locks (
            batch_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Lock handling for concurrent class commits
    ensure_setting(pool, "database_lock_retry_ms", "250").await?;
    ensure_setting(pool, "database_max_lock_wait_ms", "5000").await?;

    Ok(())
}

/// Insert a setting if it does not exist yet
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE handles concurrent initialization
    sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?;

    Ok(())
}

/// Read an integer setting, falling back to `default` when absent
pub async fn get_setting_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    let value: Option<i64> =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.unwrap_or(default))
}
