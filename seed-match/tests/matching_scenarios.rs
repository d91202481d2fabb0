//! End-to-end matching scenarios over the in-memory store
//!
//! Covers equivalence by pm_property_id / custom_id_1 / ubid, idempotent
//! reruns, matching against canonical records of earlier batches, per-record
//! error isolation, store outage resumption and tenant isolation.

mod helpers;

use helpers::*;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use seed_match::fusion::{merge, MergePolicy};
use seed_match::models::{
    BatchStatus, DataState, ErrorSeverity, FieldValue, ImportBatch, MergeState, Record, RecordKind,
};
use seed_match::{ChangeSet, MatchConfig, MatchError, RecordFilter, StateStore};

/// 14 property rows forming 7 equivalence classes, one exact duplicate
fn fourteen_rows() -> Vec<Record> {
    vec![
        property(0, &[("pm_property_id", text("100")), ("address_line_1", text("1 First St"))]),
        property(1, &[("pm_property_id", text("100")), ("custom_id_1", text("A"))]),
        property(2, &[("custom_id_1", text("A")), ("ubid", text("U1"))]),
        property(3, &[("ubid", text("U1")), ("property_name", text("Tower"))]),
        property(4, &[("pm_property_id", text("200"))]),
        property(5, &[("pm_property_id", text("200")), ("address_line_1", text("2 Oak Ave"))]),
        property(6, &[("pm_property_id", text("300"))]),
        property(7, &[("custom_id_1", text("B"))]),
        property(8, &[("ubid", text("U9"))]),
        property(9, &[("custom_id_1", text("B")), ("ubid", text("U9"))]),
        property(10, &[("pm_property_id", text("400")), ("address_line_1", text("4 Elm"))]),
        property(11, &[("pm_property_id", text("400")), ("address_line_1", text("4 Elm"))]),
        property(12, &[("address_line_1", text("13 Lonely Rd"))]),
        property(13, &[("address_line_1", text("14 Other Rd"))]),
    ]
}

#[tokio::test]
async fn test_fourteen_row_batch_one_entity_per_class() {
    let (store, progress, orchestrator) = memory_setup();
    let cycle = Uuid::new_v4();
    let (batch, _) = seed_batch(store.as_ref(), cycle, "portfolio.csv", fourteen_rows()).await;

    let token = CancellationToken::new();
    let report = orchestrator.run_match(batch.id, &token).await.unwrap();

    assert_eq!(report.status, BatchStatus::Complete);
    assert_eq!(report.total, 14);
    assert_eq!(report.processed, 14);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.new_entities, 7);
    assert_eq!(report.matched, 9);
    assert_eq!(report.merges, 6);
    assert_eq!(report.errored, 0);
    assert_eq!(store.entity_count(true).await, 7);
    assert_eq!(store.views_in_cycle(ORG, cycle, RecordKind::Property).await.unwrap().len(), 7);

    let json = progress.to_json(batch.id).await;
    assert_eq!(json[batch.id.to_string()]["progress"], 100.0);

    let duplicates = store
        .find_records(&RecordFilter::in_batch(batch.id).merge_state(MergeState::Duplicate))
        .await
        .unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].data_state, DataState::Matching);

    // Nothing left to match
    assert!(store
        .find_records(&RecordFilter::ready_for_matching(batch.id))
        .await
        .unwrap()
        .is_empty());

    let stored = orchestrator.batch_status(batch.id).await.unwrap();
    assert_eq!(stored.status, BatchStatus::Complete);
    assert_eq!(stored.report.unwrap().new_entities, 7);

    // Re-running the same batch creates nothing
    let rerun = orchestrator.run_match(batch.id, &token).await.unwrap();
    assert_eq!(rerun.status, BatchStatus::Complete);
    assert_eq!(rerun.total, 0);
    assert_eq!(rerun.new_entities, 0);
    assert_eq!(store.entity_count(false).await, 7);
}

#[tokio::test]
async fn test_resubmitted_rows_create_no_entities() {
    let (store, _, orchestrator) = memory_setup();
    let cycle = Uuid::new_v4();
    let token = CancellationToken::new();

    let (first, _) = seed_batch(store.as_ref(), cycle, "portfolio.csv", fourteen_rows()).await;
    orchestrator.run_match(first.id, &token).await.unwrap();

    // Same rows, fresh ids, later upload
    let (second, _) = seed_batch(store.as_ref(), cycle, "portfolio_v2.csv", fourteen_rows()).await;
    let report = orchestrator.run_match(second.id, &token).await.unwrap();

    assert_eq!(report.status, BatchStatus::Complete);
    assert_eq!(report.new_entities, 0);
    assert_eq!(report.processed, 14);
    assert_eq!(store.entity_count(false).await, 7);
    assert_eq!(store.entity_count(true).await, 7);
}

#[tokio::test]
async fn test_bridging_row_absorbs_existing_entity() {
    let (store, _, orchestrator) = memory_setup();
    let cycle = Uuid::new_v4();
    let token = CancellationToken::new();

    let (first, _) = seed_batch(store.as_ref(), cycle, "portfolio.csv", fourteen_rows()).await;
    orchestrator.run_match(first.id, &token).await.unwrap();

    // Links the pm_property_id 200 class with the custom_id_1 B class
    let bridge = property(
        100,
        &[("pm_property_id", text("200")), ("custom_id_1", text("B"))],
    );
    let (second, _) = seed_batch(store.as_ref(), cycle, "bridge.csv", vec![bridge]).await;
    let report = orchestrator.run_match(second.id, &token).await.unwrap();

    assert_eq!(report.new_entities, 0);
    assert_eq!(report.matched, 1);
    assert_eq!(report.merges, 2);
    assert_eq!(store.entity_count(false).await, 7);
    assert_eq!(store.entity_count(true).await, 6);
    assert_eq!(store.views_in_cycle(ORG, cycle, RecordKind::Property).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_transitive_identifiers_form_one_entity() {
    let (store, _, orchestrator) = memory_setup();
    let rows = vec![
        property(0, &[("pm_property_id", text("1"))]),
        property(1, &[("pm_property_id", text("1")), ("custom_id_1", text("X"))]),
        property(2, &[("custom_id_1", text("X")), ("ubid", text("Y"))]),
        property(3, &[("ubid", text("Y"))]),
    ];
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "chain.csv", rows).await;

    let report = orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.new_entities, 1);
    assert_eq!(report.merges, 3);

    let merged = store
        .find_records(&RecordFilter::in_batch(batch.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.data_state == DataState::Merged)
        .last()
        .unwrap();
    assert_eq!(merged.field("pm_property_id"), Some(&text("1")));
    assert_eq!(merged.field("custom_id_1"), Some(&text("X")));
    assert_eq!(merged.field("ubid"), Some(&text("Y")));
}

#[tokio::test]
async fn test_unhashable_record_does_not_stop_batch() {
    let (store, _, orchestrator) = memory_setup();
    let bad = Record::new(RecordKind::Property, ORG)
        .with_field("pm_property_id", "2")
        .with_extra("Site EUI", f64::NAN);
    let bad_id = bad.id;
    let rows = vec![
        property(0, &[("pm_property_id", text("1"))]),
        bad,
        property(2, &[("pm_property_id", text("3"))]),
    ];
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "eui.csv", rows).await;

    let report = orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, BatchStatus::Complete);
    assert_eq!(report.errored, 1);
    assert_eq!(report.new_entities, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].record_id, Some(bad_id));
    assert_eq!(report.errors[0].error_code, "VALIDATION_ERROR");
    assert_eq!(report.errors[0].severity, ErrorSeverity::Skip);

    // The bad record is left untouched for a later fix
    let untouched = store.get_record(bad_id).await.unwrap().unwrap();
    assert_eq!(untouched.merge_state, MergeState::Unknown);
}

#[tokio::test]
async fn test_error_sample_is_capped_but_count_is_not() {
    let mut config = MatchConfig::default();
    config.matching.error_sample_limit = 1;
    let (store, _, orchestrator) = memory_setup_with(config);

    let rows: Vec<Record> = (0..3)
        .map(|i| {
            Record::new(RecordKind::Property, ORG)
                .with_field("pm_property_id", i.to_string())
                .with_extra("Site EUI", f64::INFINITY)
        })
        .collect();
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "inf.csv", rows).await;

    let report = orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.errored, 3);
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn test_store_outage_leaves_batch_resumable() {
    let mut config = MatchConfig::default();
    config.matching.workers = 1;
    // Expire immediately: the failed run cannot release its lock
    config.matching.lock_ttl_secs = 0;
    let (store, _, orchestrator) = memory_setup_with(config);

    let rows = vec![
        property(0, &[("pm_property_id", text("1"))]),
        property(1, &[("pm_property_id", text("2"))]),
        property(2, &[("pm_property_id", text("3"))]),
    ];
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "outage.csv", rows).await;

    store.fail_after_commits(1);
    let err = orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::StoreUnavailable(_)));
    assert!(err.is_fatal());

    store.set_available(true);
    let stranded = orchestrator.batch_status(batch.id).await.unwrap();
    assert_eq!(stranded.status, BatchStatus::Matching);
    assert_eq!(store.entity_count(false).await, 1);

    // Resume: the committed class is skipped, the rest are matched
    let report = orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, BatchStatus::Complete);
    assert_eq!(report.total, 2);
    assert_eq!(report.new_entities, 2);
    assert_eq!(store.entity_count(false).await, 3);
}

#[tokio::test]
async fn test_organizations_never_merge() {
    let (store, _, orchestrator) = memory_setup();
    let cycle = Uuid::new_v4();
    let token = CancellationToken::new();

    let (ours, ours_rows) = seed_batch(
        store.as_ref(),
        cycle,
        "ours.csv",
        vec![property(0, &[("pm_property_id", text("100"))])],
    )
    .await;
    orchestrator.run_match(ours.id, &token).await.unwrap();

    // Another tenant importing the same identifier into the same cycle
    let theirs = ImportBatch::new_mapped(2, cycle, RecordKind::Property, Some("theirs.csv".into()));
    store.save_batch(&theirs).await.unwrap();
    let mut foreign = Record::new(RecordKind::Property, 2)
        .with_field("pm_property_id", "100")
        .in_batch(theirs.id);
    foreign.rehash().unwrap();
    let mut changes = ChangeSet::new();
    changes.upsert_record(foreign.clone());
    store.commit(changes).await.unwrap();

    let report = orchestrator.run_match(theirs.id, &token).await.unwrap();
    assert_eq!(report.new_entities, 1);
    assert_eq!(report.merges, 0);
    assert_eq!(store.entity_count(true).await, 2);

    let err = orchestrator
        .manual_match(ours_rows[0].id, foreign.id, cycle)
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::CrossOrganization { .. }));
    assert!(err.is_fatal());

    let direct = merge(&ours_rows[0], &foreign, &MergePolicy::default()).unwrap_err();
    assert!(matches!(direct, MatchError::CrossOrganization { .. }));
}

#[tokio::test]
async fn test_matching_holds_field_values_of_newest_row() {
    let (store, _, orchestrator) = memory_setup();
    let rows = vec![
        property(0, &[("pm_property_id", text("9")), ("property_name", text("Old Name"))]),
        property(1, &[("pm_property_id", text("9")), ("property_name", text("New Name"))]),
    ];
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "names.csv", rows).await;
    orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap();

    let views = store
        .views_in_cycle(ORG, batch.cycle_id, RecordKind::Property)
        .await
        .unwrap();
    assert_eq!(views.len(), 1);
    let current = store.get_record(views[0].record_id).await.unwrap().unwrap();
    assert_eq!(current.field("property_name"), Some(&FieldValue::from("New Name")));
    assert_eq!(current.merge_state, MergeState::Merged);
}

fn five_singletons() -> Vec<Record> {
    (0..5)
        .map(|i| property(i, &[("pm_property_id", text(&format!("P-{}", i)))]))
        .collect()
}

#[tokio::test]
async fn test_cancel_between_classes_stops_new_merges() {
    let mut config = MatchConfig::default();
    config.matching.workers = 1;
    let (store, sink, orchestrator) = hooked_setup(config);
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "cancel.csv", five_singletons()).await;

    let batch_id = batch.id;
    let canceller = orchestrator.clone();
    sink.set(Box::new(move || {
        let canceller = canceller.clone();
        Box::pin(async move {
            canceller.cancel_batch(batch_id).await.unwrap();
        })
    }));

    let report = orchestrator
        .run_match(batch_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, BatchStatus::Cancelled);
    assert_eq!(report.new_entities, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(store.entity_count(false).await, 1);

    let summary = orchestrator.batch_status(batch_id).await.unwrap();
    assert_eq!(summary.status, BatchStatus::Cancelled);

    // Classes after the cut were never touched
    let untouched = store
        .find_records(&RecordFilter::ready_for_matching(batch_id))
        .await
        .unwrap();
    assert_eq!(untouched.len(), 4);
}

#[tokio::test]
async fn test_run_stops_when_batch_lock_is_taken_over() {
    let mut config = MatchConfig::default();
    config.matching.workers = 1;
    // Zero TTL: the lock is renewed before every class and can be reclaimed
    config.matching.lock_ttl_secs = 0;
    let (store, sink, orchestrator) = hooked_setup(config);
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "lease.csv", five_singletons()).await;

    let batch_id = batch.id;
    let rival_store = store.clone();
    sink.set(Box::new(move || {
        let rival_store = rival_store.clone();
        Box::pin(async move {
            let taken = rival_store
                .try_acquire_batch_lock(batch_id, Uuid::new_v4(), std::time::Duration::from_secs(3600))
                .await
                .unwrap();
            assert!(taken);
        })
    }));

    let err = orchestrator
        .run_match(batch_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::Conflict(_)));
    assert_eq!(store.entity_count(false).await, 1);

    // The batch is left for the matcher that now holds the lock
    let summary = orchestrator.batch_status(batch_id).await.unwrap();
    assert_eq!(summary.status, BatchStatus::Matching);
    assert!(summary.report.is_none());
}

#[tokio::test]
async fn test_long_run_keeps_renewing_its_lock() {
    let mut config = MatchConfig::default();
    config.matching.workers = 2;
    config.matching.lock_ttl_secs = 0;
    let (store, _, orchestrator) = memory_setup_with(config);
    let (batch, _) = seed_batch(store.as_ref(), Uuid::new_v4(), "renew.csv", five_singletons()).await;

    let report = orchestrator
        .run_match(batch.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, BatchStatus::Complete);
    assert_eq!(report.new_entities, 5);
}
