//! Record (property or tax lot state) model
//!
//! A record is one versioned snapshot of an entity's field values. Records
//! are never mutated by a merge: merging always produces a new record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::MatchResult;
use crate::models::FieldValue;
use crate::services::hasher;

/// Inventory type of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Property,
    TaxLot,
}

/// Position of a record in the import lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataState {
    /// Raw row as parsed from the import file
    Imported,
    /// Columns mapped; ready for matching
    Mapped,
    /// Processed by the matcher
    Matching,
    /// Output of a merge
    Merged,
}

/// Outcome of matching for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Unknown,
    /// Promoted as a new canonical entity
    New,
    /// Produced by merging two records
    Merged,
    /// Exact duplicate of another record; never matched again
    Duplicate,
}

impl_str_enum!(RecordKind { Property => "property", TaxLot => "tax_lot" });
impl_str_enum!(DataState {
    Imported => "imported",
    Mapped => "mapped",
    Matching => "matching",
    Merged => "merged",
});
impl_str_enum!(MergeState {
    Unknown => "unknown",
    New => "new",
    Merged => "merged",
    Duplicate => "duplicate",
});

/// Property or tax lot state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub kind: RecordKind,
    pub organization_id: i64,
    /// Import batch that produced this record (volatile: not hashed)
    pub import_batch_id: Option<Uuid>,
    /// Source format label, e.g. "Assessed Raw" (volatile: not hashed)
    pub source_type: Option<String>,
    pub data_state: DataState,
    pub merge_state: MergeState,
    /// Canonical typed fields (pm_property_id, address_line_1, ...)
    pub fields: BTreeMap<String, FieldValue>,
    /// Arbitrary additional columns
    pub extra_data: BTreeMap<String, FieldValue>,
    /// Hex SHA-256 of the comparable fields
    pub hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create an empty record in `Mapped` state
    pub fn new(kind: RecordKind, organization_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            organization_id,
            import_batch_id: None,
            source_type: None,
            data_state: DataState::Mapped,
            merge_state: MergeState::Unknown,
            fields: BTreeMap::new(),
            extra_data: BTreeMap::new(),
            hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set a typed field (hash is not refreshed; call `rehash`)
    pub fn with_field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Builder: set an extra-data value (hash is not refreshed; call `rehash`)
    pub fn with_extra(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.extra_data.insert(key.to_string(), value.into());
        self
    }

    /// Builder: attach to an import batch
    pub fn in_batch(mut self, batch_id: Uuid) -> Self {
        self.import_batch_id = Some(batch_id);
        self
    }

    /// Set a typed field and recompute the hash
    pub fn set_field(&mut self, key: &str, value: impl Into<FieldValue>) -> MatchResult<()> {
        self.fields.insert(key.to_string(), value.into());
        self.touch()
    }

    /// Set an extra-data value and recompute the hash
    pub fn set_extra(&mut self, key: &str, value: impl Into<FieldValue>) -> MatchResult<()> {
        self.extra_data.insert(key.to_string(), value.into());
        self.touch()
    }

    /// Remove a typed field and recompute the hash
    pub fn remove_field(&mut self, key: &str) -> MatchResult<Option<FieldValue>> {
        let removed = self.fields.remove(key);
        self.touch()?;
        Ok(removed)
    }

    /// Typed field value, treating empty values as absent
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).filter(|v| !v.is_empty())
    }

    /// Extra-data value, treating empty values as absent
    pub fn extra(&self, key: &str) -> Option<&FieldValue> {
        self.extra_data.get(key).filter(|v| !v.is_empty())
    }

    /// Look up `key` in typed fields first, then in extra data
    pub fn lookup(&self, key: &str) -> Option<&FieldValue> {
        self.field(key).or_else(|| self.extra(key))
    }

    /// Recompute the content hash from the comparable fields
    pub fn rehash(&mut self) -> MatchResult<&str> {
        let digest = hasher::compute_hash(self)?;
        self.hash = Some(digest);
        Ok(self.hash.as_deref().unwrap_or_default())
    }

    /// True once the matcher has decided this record's fate
    pub fn is_processed(&self) -> bool {
        self.merge_state != MergeState::Unknown || self.data_state != DataState::Mapped
    }

    fn touch(&mut self) -> MatchResult<()> {
        self.updated_at = Utc::now();
        self.rehash().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_enum_round_trip() {
        assert_eq!(RecordKind::TaxLot.as_str(), "tax_lot");
        assert_eq!("merged".parse::<MergeState>().unwrap(), MergeState::Merged);
        assert_eq!("mapped".parse::<DataState>().unwrap(), DataState::Mapped);
        assert!("bogus".parse::<DataState>().is_err());
    }

    #[test]
    fn test_set_field_refreshes_hash() {
        let mut record = Record::new(RecordKind::Property, 1).with_field("pm_property_id", "100");
        let first = record.rehash().unwrap().to_string();

        record.set_field("pm_property_id", "101").unwrap();
        assert_ne!(record.hash.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn test_empty_values_are_absent() {
        let record = Record::new(RecordKind::Property, 1)
            .with_field("custom_id_1", "  ")
            .with_extra("Owner", "ACME");
        assert!(record.field("custom_id_1").is_none());
        assert_eq!(record.lookup("Owner"), Some(&FieldValue::from("ACME")));
    }

    #[test]
    fn test_processed_flag() {
        let mut record = Record::new(RecordKind::Property, 1);
        assert!(!record.is_processed());
        record.merge_state = MergeState::Duplicate;
        assert!(record.is_processed());
    }
}
