//! Content Hashing and Deduplication
//!
//! Calculates a SHA-256 digest over the comparable subset of a record
//! (organization id, typed fields, extra data) and collapses exact
//! duplicates before matching runs.
//!
//! **Encoding:** every component is written as a length-prefixed
//! `(key, type tag, value)` triple in sorted key order, so the digest is
//! independent of insertion order and stable across process restarts.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{MatchError, MatchResult};
use crate::models::{FieldValue, Record, RecordKind};

/// Domain separator; bump when the encoding changes
const HASH_VERSION: &[u8] = b"seed-record-hash:v1";

/// Typed-field keys never included in the hash
pub const VOLATILE_FIELDS: &[&str] = &[
    "id",
    "pk",
    "created",
    "updated",
    "import_file",
    "import_file_id",
    "source_type",
    "data_state",
    "merge_state",
    "hash_object",
];

/// Compute the hex SHA-256 content hash of a record.
///
/// Null and empty values are skipped, so an absent field and a null field
/// hash identically. The organization id is always included, so records
/// with no populated fields still hash to an organization-specific sentinel.
///
/// # Errors
/// `MatchError::Validation` when a value cannot be encoded stably
/// (non-finite numbers).
pub fn compute_hash(record: &Record) -> MatchResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(HASH_VERSION);

    write_component(&mut hasher, b"organization_id", 'i', &record.organization_id.to_string());

    hasher.update(b"\x1efields");
    for (key, value) in &record.fields {
        if VOLATILE_FIELDS.contains(&key.as_str()) || value.is_empty() {
            continue;
        }
        let text = encode_value(record.id, key, value)?;
        write_component(&mut hasher, key.as_bytes(), value.type_tag(), &text);
    }

    hasher.update(b"\x1eextra_data");
    for (key, value) in &record.extra_data {
        if value.is_empty() {
            continue;
        }
        let text = encode_value(record.id, key, value)?;
        write_component(&mut hasher, key.as_bytes(), value.type_tag(), &text);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn write_component(hasher: &mut Sha256, key: &[u8], tag: char, value: &str) {
    hasher.update((key.len() as u64).to_le_bytes());
    hasher.update(key);
    let mut tag_buf = [0u8; 4];
    hasher.update(tag.encode_utf8(&mut tag_buf).as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn encode_value(record_id: Uuid, key: &str, value: &FieldValue) -> MatchResult<String> {
    match value {
        FieldValue::Number(n) if !n.is_finite() => Err(MatchError::Validation {
            record_id,
            message: format!("field '{}' holds unhashable number {}", key, n),
        }),
        // Canonical text: no trimming, the stored value is what is compared
        other => Ok(other.to_string()),
    }
}

/// A set of records that hashed identically
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    /// First-seen record of the group (kept)
    pub canonical_id: Uuid,
    pub hash: String,
    /// Later records with the same content, in input order
    pub duplicates: Vec<Record>,
}

/// Result of `filter_duplicates`
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// First-seen record of every distinct content, in input order
    pub unique: Vec<Record>,
    /// Groups that had at least one duplicate, ordered by canonical position
    pub duplicate_groups: Vec<DuplicateGroup>,
    /// Records whose hash could not be computed
    pub errored: Vec<(Record, MatchError)>,
}

impl DedupOutcome {
    /// Total number of records tagged as duplicates
    pub fn duplicate_count(&self) -> usize {
        self.duplicate_groups.iter().map(|g| g.duplicates.len()).sum()
    }
}

/// Partition records by content hash, keeping the first-seen record of each
/// group. Stable: ordering among uniques and among duplicates follows the
/// input. Every record's hash is refreshed on the way through.
pub fn filter_duplicates(records: Vec<Record>) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut seen: HashMap<(i64, RecordKind, String), usize> = HashMap::new();
    let mut groups: Vec<Option<DuplicateGroup>> = Vec::new();

    for mut record in records {
        let hash = match record.rehash() {
            Ok(hash) => hash.to_string(),
            Err(err) => {
                tracing::warn!(record_id = %record.id, error = %err, "Unhashable record");
                outcome.errored.push((record, err));
                continue;
            }
        };

        let key = (record.organization_id, record.kind, hash.clone());
        match seen.get(&key) {
            Some(&unique_index) => {
                tracing::debug!(
                    record_id = %record.id,
                    canonical_id = %outcome.unique[unique_index].id,
                    "Duplicate hash detected"
                );
                let canonical_id = outcome.unique[unique_index].id;
                groups[unique_index]
                    .get_or_insert_with(|| DuplicateGroup {
                        canonical_id,
                        hash,
                        duplicates: Vec::new(),
                    })
                    .duplicates
                    .push(record);
            }
            None => {
                seen.insert(key, outcome.unique.len());
                outcome.unique.push(record);
                groups.push(None);
            }
        }
    }

    outcome.duplicate_groups = groups.into_iter().flatten().collect();

    tracing::debug!(
        unique = outcome.unique.len(),
        duplicates = outcome.duplicate_count(),
        errored = outcome.errored.len(),
        "Deduplication complete"
    );

    outcome
}
