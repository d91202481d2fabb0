// Record Merger - Field-Wise Precedence with Provenance
//
// Combines an older and a newer version of a record into a brand-new record.
// Inputs are never mutated. Every output field and extra-data key is
// attributed to the input record that supplied it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::error::{MatchError, MatchResult};
use crate::fusion::footprint::{self, FootprintField, FOOTPRINT_FIELDS};
use crate::models::{DataState, FieldValue, MergeState, Record};

/// Which input of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Old,
    New,
}

/// Per-field precedence override, e.g. keep manually edited values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOverride {
    /// Typed field or extra-data key
    pub field: String,
    pub authoritative: Side,
}

/// Field precedence policy; by default the newer value wins a conflict
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    overrides: HashMap<String, Side>,
}

impl MergePolicy {
    pub fn new(overrides: &[FieldOverride]) -> Self {
        Self {
            overrides: overrides
                .iter()
                .map(|o| (o.field.clone(), o.authoritative))
                .collect(),
        }
    }

    /// Side that wins when both inputs hold different values for `field`
    pub fn conflict_winner(&self, field: &str) -> Side {
        self.overrides.get(field).copied().unwrap_or(Side::New)
    }
}

/// Source record of every value in a merged record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub fields: BTreeMap<String, Uuid>,
    pub extra_data: BTreeMap<String, Uuid>,
}

impl Provenance {
    /// True when every entry names `record_id`
    pub fn all_from(&self, record_id: Uuid) -> bool {
        self.fields
            .values()
            .chain(self.extra_data.values())
            .all(|id| *id == record_id)
    }
}

/// Result of merging two records
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: Record,
    pub provenance: Provenance,
}

/// Merge `old` and `new` under `policy`.
///
/// # Errors
/// - `CrossOrganization` when the inputs belong to different organizations
///   or are different record kinds (fatal)
/// - `Validation` when the merged record cannot be hashed
pub fn merge(old: &Record, new: &Record, policy: &MergePolicy) -> MatchResult<MergeOutcome> {
    if old.organization_id != new.organization_id {
        return Err(MatchError::CrossOrganization {
            left: old.id,
            right: new.id,
            reason: format!(
                "organization {} differs from {}",
                old.organization_id, new.organization_id
            ),
        });
    }
    if old.kind != new.kind {
        return Err(MatchError::CrossOrganization {
            left: old.id,
            right: new.id,
            reason: format!("record kind {} differs from {}", old.kind, new.kind),
        });
    }

    let mut merged = Record::new(new.kind, new.organization_id);
    merged.import_batch_id = new.import_batch_id.or(old.import_batch_id);
    merged.source_type = new.source_type.clone().or_else(|| old.source_type.clone());
    merged.data_state = DataState::Merged;
    merged.merge_state = MergeState::Merged;

    let mut provenance = Provenance::default();
    let source_id = |side: Side| match side {
        Side::Old => old.id,
        Side::New => new.id,
    };

    let field_keys: BTreeSet<&String> = old.fields.keys().chain(new.fields.keys()).collect();
    for key in field_keys {
        if footprint::is_footprint_key(key) {
            continue;
        }
        if let Some((value, side)) = pick(old.field(key), new.field(key), policy.conflict_winner(key)) {
            merged.fields.insert(key.clone(), value.clone());
            provenance.fields.insert(key.clone(), source_id(side));
        }
    }

    let extra_keys: BTreeSet<&String> = old
        .extra_data
        .keys()
        .chain(new.extra_data.keys())
        .collect();
    for key in extra_keys {
        if footprint::is_footprint_key(key) {
            continue;
        }
        if let Some((value, side)) = pick(old.extra(key), new.extra(key), policy.conflict_winner(key)) {
            merged.extra_data.insert(key.clone(), value.clone());
            provenance.extra_data.insert(key.clone(), source_id(side));
        }
    }

    for pair in FOOTPRINT_FIELDS {
        merge_footprint(pair, old, new, policy, &mut merged, &mut provenance, &source_id);
    }

    merged.rehash()?;

    debug!(
        old_id = %old.id,
        new_id = %new.id,
        merged_id = %merged.id,
        fields = merged.fields.len(),
        extra = merged.extra_data.len(),
        "Merged records"
    );

    Ok(MergeOutcome { merged, provenance })
}

/// Precedence for one key. Equal values credit the old side.
fn pick<'a>(
    old: Option<&'a FieldValue>,
    new: Option<&'a FieldValue>,
    conflict_winner: Side,
) -> Option<(&'a FieldValue, Side)> {
    match (old, new) {
        (None, None) => None,
        (Some(o), None) => Some((o, Side::Old)),
        (None, Some(n)) => Some((n, Side::New)),
        (Some(o), Some(n)) if o == n => Some((o, Side::Old)),
        (Some(o), Some(n)) => match conflict_winner {
            Side::Old => Some((o, Side::Old)),
            Side::New => Some((n, Side::New)),
        },
    }
}

/// One side's footprint, split into a usable geometry and unparseable text
struct FootprintSide<'a> {
    geometry: Option<&'a FieldValue>,
    /// Unparseable value stored in the typed field itself
    typed_invalid: Option<&'a FieldValue>,
    companion: Option<&'a FieldValue>,
}

impl<'a> FootprintSide<'a> {
    fn of(record: &'a Record, pair: &FootprintField, companion: &str) -> Self {
        let typed = record.field(pair.field);
        Self {
            geometry: typed.filter(|v| footprint::is_valid_footprint(v)),
            typed_invalid: typed.filter(|v| !footprint::is_valid_footprint(v)),
            companion: record.extra(companion),
        }
    }

    /// Invalid text bound for the companion key once the output holds a
    /// geometry; a typed invalid value cannot stay next to it
    fn displaced(&self) -> Option<&'a FieldValue> {
        self.companion.or(self.typed_invalid)
    }
}

fn merge_footprint(
    pair: &FootprintField,
    old: &Record,
    new: &Record,
    policy: &MergePolicy,
    merged: &mut Record,
    provenance: &mut Provenance,
    source_id: &dyn Fn(Side) -> Uuid,
) {
    let companion = pair.companion_key();
    let old_side = FootprintSide::of(old, pair, &companion);
    let new_side = FootprintSide::of(new, pair, &companion);
    let field_winner = policy.conflict_winner(pair.field);
    let companion_winner = policy.conflict_winner(&companion);

    let geometry = pick(old_side.geometry, new_side.geometry, field_winner);

    let (typed, mut invalid) = match geometry {
        Some(_) => {
            let invalid = pick(old_side.displaced(), new_side.displaced(), companion_winner);
            (geometry, invalid)
        }
        // No usable geometry: invalid values stay where each side stored them
        None => (
            pick(old_side.typed_invalid, new_side.typed_invalid, field_winner),
            pick(old_side.companion, new_side.companion, companion_winner),
        ),
    };

    // A valid new geometry in the output supersedes an inherited invalid companion
    let new_geometry_kept = match (geometry, new_side.geometry) {
        (Some((value, _)), Some(new_value)) => value == new_value,
        _ => false,
    };
    if new_geometry_kept && new_side.displaced().is_none() {
        invalid = None;
    }

    if let Some((value, side)) = typed {
        merged.fields.insert(pair.field.to_string(), value.clone());
        provenance.fields.insert(pair.field.to_string(), source_id(side));
    }
    if let Some((value, side)) = invalid {
        merged.extra_data.insert(companion.clone(), value.clone());
        provenance.extra_data.insert(companion, source_id(side));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;

    const SQUARE: &str = "POLYGON ((0 0, 1 0, 1 1, 0 0))";
    const OTHER_SQUARE: &str = "POLYGON ((0 0, 2 0, 2 2, 0 0))";
    const BROKEN: &str = "POLYGON ((0 0, 1 0";

    fn prop() -> Record {
        Record::new(RecordKind::Property, 1)
    }

    #[test]
    fn test_single_side_values_pass_through() {
        let old = prop().with_field("address_line_1", "1 Main").with_extra("Owner", "A");
        let new = prop().with_field("ubid", "U1").with_extra("Floors", 3i64);

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.field("address_line_1"), Some(&FieldValue::from("1 Main")));
        assert_eq!(out.merged.field("ubid"), Some(&FieldValue::from("U1")));
        assert_eq!(out.provenance.fields["address_line_1"], old.id);
        assert_eq!(out.provenance.fields["ubid"], new.id);
        assert_eq!(out.provenance.extra_data["Owner"], old.id);
        assert_eq!(out.provenance.extra_data["Floors"], new.id);
    }

    #[test]
    fn test_conflict_new_wins_by_default() {
        let old = prop().with_field("property_name", "Old Name");
        let new = prop().with_field("property_name", "New Name");

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.field("property_name"), Some(&FieldValue::from("New Name")));
        assert_eq!(out.provenance.fields["property_name"], new.id);
    }

    #[test]
    fn test_override_keeps_old_value() {
        let policy = MergePolicy::new(&[FieldOverride {
            field: "property_name".into(),
            authoritative: Side::Old,
        }]);
        let old = prop().with_field("property_name", "Edited").with_extra("Note", "x");
        let new = prop().with_field("property_name", "Raw").with_extra("Note", "y");

        let out = merge(&old, &new, &policy).unwrap();
        assert_eq!(out.merged.field("property_name"), Some(&FieldValue::from("Edited")));
        assert_eq!(out.provenance.fields["property_name"], old.id);
        // Overrides are per key
        assert_eq!(out.merged.extra("Note"), Some(&FieldValue::from("y")));
    }

    #[test]
    fn test_empty_values_omitted_and_never_override() {
        let old = prop().with_field("city", "Denver").with_field("state", FieldValue::Null);
        let new = prop().with_field("city", "  ").with_field("state", "");

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.field("city"), Some(&FieldValue::from("Denver")));
        assert!(!out.merged.fields.contains_key("state"));
        assert!(!out.provenance.fields.contains_key("state"));
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let a = prop()
            .with_field("pm_property_id", "100")
            .with_field("property_footprint", SQUARE)
            .with_extra("Year Built", 1950i64);
        let mut a_hashed = a.clone();
        a_hashed.rehash().unwrap();

        let out = merge(&a, &a, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.fields, a.fields);
        assert_eq!(out.merged.extra_data, a.extra_data);
        assert_eq!(out.merged.hash, a_hashed.hash);
        assert!(out.provenance.all_from(a.id));
        assert_eq!(out.provenance.fields.len(), a.fields.len());
    }

    #[test]
    fn test_merged_record_is_new() {
        let batch = Uuid::new_v4();
        let old = prop().with_field("ubid", "U1");
        let new = prop().with_field("ubid", "U1").in_batch(batch);

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_ne!(out.merged.id, old.id);
        assert_ne!(out.merged.id, new.id);
        assert_eq!(out.merged.data_state, DataState::Merged);
        assert_eq!(out.merged.merge_state, MergeState::Merged);
        assert_eq!(out.merged.import_batch_id, Some(batch));
        assert!(out.merged.hash.is_some());
    }

    #[test]
    fn test_cross_organization_rejected() {
        let old = Record::new(RecordKind::Property, 1);
        let new = Record::new(RecordKind::Property, 2);
        let err = merge(&old, &new, &MergePolicy::default()).unwrap_err();
        assert!(matches!(err, MatchError::CrossOrganization { .. }));
        assert!(err.is_fatal());

        let lot = Record::new(RecordKind::TaxLot, 1);
        assert!(matches!(
            merge(&old, &lot, &MergePolicy::default()),
            Err(MatchError::CrossOrganization { .. })
        ));
    }

    #[test]
    fn test_invalid_new_footprint_kept_in_companion() {
        let old = prop().with_field("property_footprint", SQUARE);
        let new = prop().with_field("property_footprint", BROKEN);

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.field("property_footprint"), Some(&FieldValue::from(SQUARE)));
        assert_eq!(
            out.merged.extra("Property Footprint (Invalid Footprint)"),
            Some(&FieldValue::from(BROKEN))
        );
        assert_eq!(out.provenance.fields["property_footprint"], old.id);
        assert_eq!(
            out.provenance.extra_data["Property Footprint (Invalid Footprint)"],
            new.id
        );
    }

    #[test]
    fn test_valid_new_footprint_clears_inherited_companion() {
        let old = prop().with_extra("Property Footprint (Invalid Footprint)", BROKEN);
        let new = prop().with_field("property_footprint", OTHER_SQUARE);

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(
            out.merged.field("property_footprint"),
            Some(&FieldValue::from(OTHER_SQUARE))
        );
        assert!(out.merged.extra("Property Footprint (Invalid Footprint)").is_none());
    }

    #[test]
    fn test_valid_new_footprint_replaces_old_geometry() {
        let old = prop().with_field("taxlot_footprint", SQUARE);
        let new = prop().with_field("taxlot_footprint", OTHER_SQUARE);

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.field("taxlot_footprint"), Some(&FieldValue::from(OTHER_SQUARE)));
        assert_eq!(out.provenance.fields["taxlot_footprint"], new.id);
    }

    #[test]
    fn test_merge_with_itself_keeps_invalid_typed_footprint() {
        let a = prop()
            .with_field("pm_property_id", "1")
            .with_field("property_footprint", BROKEN);

        let out = merge(&a, &a, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.fields, a.fields);
        assert_eq!(out.merged.extra_data, a.extra_data);
        assert!(out.merged.extra("Property Footprint (Invalid Footprint)").is_none());
        assert!(out.provenance.all_from(a.id));
    }

    #[test]
    fn test_invalid_typed_footprints_stay_typed_without_geometry() {
        let old = prop().with_field("property_footprint", BROKEN);
        let new = prop().with_field("property_footprint", "POLYGON ((5 5");

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(
            out.merged.field("property_footprint"),
            Some(&FieldValue::from("POLYGON ((5 5"))
        );
        assert_eq!(out.provenance.fields["property_footprint"], new.id);
        assert!(out.merged.extra("Property Footprint (Invalid Footprint)").is_none());
    }

    #[test]
    fn test_valid_new_footprint_supersedes_invalid_typed_old() {
        let old = prop().with_field("property_footprint", BROKEN);
        let new = prop().with_field("property_footprint", SQUARE);

        let out = merge(&old, &new, &MergePolicy::default()).unwrap();
        assert_eq!(out.merged.field("property_footprint"), Some(&FieldValue::from(SQUARE)));
        assert!(out.merged.extra("Property Footprint (Invalid Footprint)").is_none());
    }
}
