//! Durability tests: everything written to the ledger must survive a
//! close-and-reopen cycle, which models a host restart.

use featureguard::{Feature, Ledger, ScanBatcher};
use std::sync::Arc;

#[test]
fn scanned_cells_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let ledger = Ledger::open(dir.path()).expect("open");
        ledger
            .mark_cells_scanned("overworld", &[(3, 4), (-1, 7), (0, 0)])
            .expect("mark");
        ledger.flush().expect("flush");
    }

    let ledger = Ledger::open(dir.path()).expect("reopen");
    assert!(ledger.is_cell_scanned("overworld", 3, 4).expect("check"));
    assert!(ledger.is_cell_scanned("overworld", -1, 7).expect("check"));
    assert!(!ledger.is_cell_scanned("overworld", 9, 9).expect("check"));
    assert_eq!(ledger.scanned_count("overworld").expect("count"), 3);
}

#[test]
fn scanned_cells_are_scoped_per_world() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open(dir.path()).expect("open");

    ledger.mark_cells_scanned("overworld", &[(3, 4)]).expect("mark");
    ledger.mark_cells_scanned("nether", &[(3, 4)]).expect("mark");

    assert_eq!(ledger.scanned_cells("overworld").expect("list").len(), 1);
    assert_eq!(ledger.clear_scanned_cells("nether").expect("clear"), 1);
    assert!(ledger.is_cell_scanned("overworld", 3, 4).expect("check"));
    assert!(!ledger.is_cell_scanned("nether", 3, 4).expect("check"));
}

#[test]
fn feature_records_and_region_ids_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let feature = Feature::new("overworld", "minecraft:village", 120, -48);
    let region_id = feature.region_id();

    {
        let ledger = Ledger::open(dir.path()).expect("open");
        assert!(ledger.insert_feature_if_absent(&feature).expect("insert"));
        ledger.set_region(&feature, &region_id).expect("set region");
        ledger.flush().expect("flush");
    }

    let ledger = Ledger::open(dir.path()).expect("reopen");
    let record = ledger.feature(&feature).expect("get").expect("present");
    assert!(record.has_region);
    assert_eq!(record.region_id.as_deref(), Some(region_id.as_str()));
    assert!(ledger.is_feature_regioned(&feature).expect("check"));
    assert_eq!(ledger.regioned_count().expect("count"), 1);
}

#[test]
fn duplicate_feature_insert_is_rejected_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let feature = Feature::new("overworld", "minecraft:well", 8, 8);

    {
        let ledger = Ledger::open(dir.path()).expect("open");
        assert!(ledger.insert_feature_if_absent(&feature).expect("insert"));
        ledger.flush().expect("flush");
    }

    let ledger = Ledger::open(dir.path()).expect("reopen");
    assert!(!ledger.insert_feature_if_absent(&feature).expect("insert"));
    assert_eq!(ledger.feature_count(), 1);
}

#[test]
fn batched_marks_are_durable_after_flush() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let ledger = Ledger::open(dir.path()).expect("open");
        let batcher = Arc::new(ScanBatcher::new(ledger, 100));
        for x in 0..10 {
            batcher.push("overworld", x, 0);
        }
        assert_eq!(batcher.buffered(), 10);
        batcher.flush_all();
        assert_eq!(batcher.buffered(), 0);
    }

    let ledger = Ledger::open(dir.path()).expect("reopen");
    for x in 0..10 {
        assert!(ledger.is_cell_scanned("overworld", x, 0).expect("check"));
    }
}

#[test]
fn features_matching_filters_pattern_and_region_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open(dir.path()).expect("open");

    let village = Feature::new("overworld", "minecraft:village", 0, 0);
    let fortress = Feature::new("nether", "minecraft:fortress", 16, 16);
    ledger.insert_feature_if_absent(&village).expect("insert");
    ledger.insert_feature_if_absent(&fortress).expect("insert");
    ledger.set_region(&village, &village.region_id()).expect("set");

    let all = ledger.features_matching("*", false).expect("query");
    assert_eq!(all.len(), 2);

    let unregioned = ledger.features_matching("*", true).expect("query");
    assert_eq!(unregioned.len(), 1);
    assert_eq!(unregioned[0].feature.feature_type, "minecraft:fortress");

    let villages = ledger.features_matching("minecraft:v*", false).expect("query");
    assert_eq!(villages.len(), 1);
}
