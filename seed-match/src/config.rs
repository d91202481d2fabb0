//! Configuration resolution for seed-match
//!
//! Provides multi-tier configuration resolution with CLI → ENV → TOML file →
//! compiled defaults priority. The file holds the equivalence rule sets per
//! record kind, merge overrides and matching run settings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

use crate::error::{MatchError, MatchResult};
use crate::fusion::{FieldOverride, MergePolicy};
use crate::models::RecordKind;
use crate::services::partitioner::EquivalenceRule;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "SEED_MATCH_CONFIG";

/// Environment variable naming the SQLite database
pub const DATABASE_ENV_VAR: &str = "SEED_MATCH_DATABASE";

/// Application name used for platform config/data directories
pub const APP_NAME: &str = "seed-match";

/// Matching run settings (`[matching]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    /// Equivalence classes processed concurrently
    pub workers: usize,
    /// Maximum errors kept in a batch report
    pub error_sample_limit: usize,
    /// Depth cap for lineage traversals
    pub max_history_depth: usize,
    pub progress_ttl_secs: u64,
    pub lock_ttl_secs: u64,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            error_sample_limit: 20,
            max_history_depth: 10_000,
            progress_ttl_secs: 3600,
            lock_ttl_secs: 3600,
        }
    }
}

impl MatchingSettings {
    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Complete seed-match configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub matching: MatchingSettings,
    /// Identity rules for properties, highest priority first
    pub property_rules: Vec<EquivalenceRule>,
    /// Identity rules for tax lots, highest priority first
    pub taxlot_rules: Vec<EquivalenceRule>,
    pub merge_overrides: Vec<FieldOverride>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            matching: MatchingSettings::default(),
            property_rules: vec![
                EquivalenceRule::new("pm_property_id"),
                EquivalenceRule::new("custom_id_1"),
                EquivalenceRule::new("ubid"),
            ],
            taxlot_rules: vec![
                EquivalenceRule::new("jurisdiction_tax_lot_id"),
                EquivalenceRule::new("custom_id_1"),
                EquivalenceRule::new("ulid"),
            ],
            merge_overrides: Vec::new(),
        }
    }
}

impl MatchConfig {
    /// Resolve and load the configuration, then validate it
    ///
    /// **Priority:** CLI argument → `SEED_MATCH_CONFIG` → platform config file → defaults
    pub fn load(cli_path: Option<&str>) -> MatchResult<Self> {
        let config: MatchConfig =
            seed_common::config::load_or_default(cli_path, CONFIG_ENV_VAR, APP_NAME)?;
        config.validate()?;

        info!(
            property_rules = config.property_rules.len(),
            taxlot_rules = config.taxlot_rules.len(),
            merge_overrides = config.merge_overrides.len(),
            workers = config.matching.workers,
            "Loaded matching configuration"
        );
        Ok(config)
    }

    /// Parse TOML text and validate it
    pub fn from_toml(content: &str) -> MatchResult<Self> {
        let config: MatchConfig = seed_common::config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> MatchResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MatchError::Configuration(format!("Serialize TOML failed: {}", e)))
    }

    /// Reject empty rule lists, blank field names and duplicate fields
    pub fn validate(&self) -> MatchResult<()> {
        validate_rules("property_rules", &self.property_rules)?;
        validate_rules("taxlot_rules", &self.taxlot_rules)?;

        let mut seen = HashSet::new();
        for o in &self.merge_overrides {
            if o.field.trim().is_empty() {
                return Err(MatchError::Configuration(
                    "merge_overrides: blank field name".to_string(),
                ));
            }
            if !seen.insert(o.field.as_str()) {
                return Err(MatchError::Configuration(format!(
                    "merge_overrides: duplicate field '{}'",
                    o.field
                )));
            }
        }

        if self.matching.workers == 0 {
            return Err(MatchError::Configuration(
                "matching.workers must be at least 1".to_string(),
            ));
        }
        if self.matching.max_history_depth == 0 {
            return Err(MatchError::Configuration(
                "matching.max_history_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Rule set for a record kind
    pub fn rules_for(&self, kind: RecordKind) -> &[EquivalenceRule] {
        match kind {
            RecordKind::Property => &self.property_rules,
            RecordKind::TaxLot => &self.taxlot_rules,
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy::new(&self.merge_overrides)
    }
}

fn validate_rules(name: &str, rules: &[EquivalenceRule]) -> MatchResult<()> {
    if rules.is_empty() {
        return Err(MatchError::Configuration(format!("{} must not be empty", name)));
    }

    let mut seen = HashSet::new();
    for rule in rules {
        if rule.field.trim().is_empty()
            || rule.secondary_fields.iter().any(|f| f.trim().is_empty())
        {
            return Err(MatchError::Configuration(format!("{}: blank field name", name)));
        }
        if !seen.insert(rule.field.as_str()) {
            return Err(MatchError::Configuration(format!(
                "{}: duplicate rule field '{}'",
                name, rule.field
            )));
        }
    }
    Ok(())
}
