//! seed-match - record matching command line
//!
//! Runs the matching engine against a SQLite database prepared by the
//! import pipeline:
//!
//! ```bash
//! seed-match [--config <file>] [--database <file>] match <batch-id>
//! seed-match history <record-id>
//! seed-match coparent <record-id>
//! seed-match unmatch <record-id>
//! seed-match manual-match <record-a> <record-b> --cycle <cycle-id>
//! seed-match edit <record-id> --set property_name="Main Library"
//! seed-match status <batch-id>
//! seed-match cancel <batch-id>
//! seed-match config
//! ```
//!
//! Results are printed as JSON on stdout; logs go to stderr
//! (`RUST_LOG` controls the level).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use seed_match::config::{MatchConfig, APP_NAME, DATABASE_ENV_VAR};
use seed_match::models::FieldValue;
use seed_match::services::MemoryProgressCache;
use seed_match::{MatchOrchestrator, SqliteStore};

/// Record matching, merging and history for property / tax lot inventories
#[derive(Parser, Debug)]
#[command(name = "seed-match")]
#[command(about = "Record matching, merging and history for SEED inventories")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(long, global = true, value_name = "FILE", env = "SEED_MATCH_CONFIG")]
    config: Option<String>,

    /// SQLite database
    #[arg(long, global = true, value_name = "FILE", env = "SEED_MATCH_DATABASE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match every mapped record of an import batch
    Match { batch_id: Uuid },
    /// Show a record's history, most recent first
    History { record_id: Uuid },
    /// Records a freshly imported record was matched with
    Coparent { record_id: Uuid },
    /// Split a merged record back into its two branches
    Unmatch { record_id: Uuid },
    /// Merge two records bound to views of the same cycle
    ManualMatch {
        record_a: Uuid,
        record_b: Uuid,
        #[arg(long)]
        cycle: Uuid,
    },
    /// Create an edited version of a record
    Edit {
        record_id: Uuid,
        /// KEY=VALUE, repeatable; an empty value removes the key
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        set: Vec<String>,
    },
    /// Batch status and last matching report
    Status { batch_id: Uuid },
    /// Mark a batch cancelled
    Cancel { batch_id: Uuid },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config = MatchConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let db_path = seed_common::config::resolve_database_path(
        args.database.as_deref(),
        DATABASE_ENV_VAR,
        APP_NAME,
    );
    info!("Database: {}", db_path.display());

    let pool = seed_common::db::init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let store = Arc::new(SqliteStore::open(pool).await?);
    let progress = Arc::new(MemoryProgressCache::new());
    let orchestrator = MatchOrchestrator::new(store, progress, config);

    match args.command {
        Command::Match { batch_id } => {
            let cancel_token = CancellationToken::new();
            let ctrl_c_token = cancel_token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping after the current classes");
                    ctrl_c_token.cancel();
                }
            });

            let report = orchestrator.run_match(batch_id, &cancel_token).await?;
            print_json(&report)?;
        }
        Command::History { record_id } => {
            let (history, master) = orchestrator.lineage().history(record_id).await?;
            print_json(&serde_json::json!({ "history": history, "master": master }))?;
        }
        Command::Coparent { record_id } => {
            let (coparents, count) = orchestrator.lineage().coparent(record_id).await?;
            print_json(&serde_json::json!({ "coparents": coparents, "count": count }))?;
        }
        Command::Unmatch { record_id } => {
            let outcome = orchestrator.lineage().unmatch(record_id).await?;
            print_json(&outcome)?;
        }
        Command::ManualMatch {
            record_a,
            record_b,
            cycle,
        } => {
            let outcome = orchestrator.manual_match(record_a, record_b, cycle).await?;
            print_json(&serde_json::json!({
                "merged": outcome.merged,
                "entity_id": outcome.entity_id,
                "absorbed_entity_id": outcome.absorbed_entity_id,
            }))?;
        }
        Command::Edit { record_id, set } => {
            let edits = parse_edits(&set)?;
            let edited = orchestrator.manual_edit(record_id, edits).await?;
            print_json(&edited)?;
        }
        Command::Status { batch_id } => {
            let summary = orchestrator.batch_status(batch_id).await?;
            print_json(&summary)?;
        }
        Command::Cancel { batch_id } => {
            let batch = orchestrator.cancel_batch(batch_id).await?;
            print_json(&batch)?;
        }
        Command::Config => {}
    }

    Ok(())
}

fn parse_edits(pairs: &[String]) -> Result<BTreeMap<String, FieldValue>> {
    let mut edits = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
        let key = key.trim();
        anyhow::ensure!(!key.is_empty(), "Empty key in '{}'", pair);
        edits.insert(key.to_string(), FieldValue::from(value));
    }
    Ok(edits)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
