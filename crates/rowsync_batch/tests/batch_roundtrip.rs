//! Batch engine integration tests.

use proptest::prelude::*;
use rowsync_batch::{BatchConfig, BatchEngine, BatchError, BatchInfo, BatchReader};
use rowsync_core::{CyclePolicy, TableName, TrackedRow};
use rowsync_testkit::fixtures::{customer, order, people_table, shop_schema};
use rowsync_testkit::generators::tracked_rows_strategy;
use std::fs;
use tempfile::tempdir;

fn live(rows: Vec<rowsync_core::Row>) -> Vec<TrackedRow> {
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| TrackedRow::live(row, i as u64 + 1, None))
        .collect()
}

#[test]
fn parts_follow_dependency_order_then_sequence() {
    let dir = tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(2));
    let schema = shop_schema();
    let mut writer = engine.create_batch(&schema).unwrap();

    // Dependent rows first, interleaved with their parents.
    let orders: TableName = "orders".into();
    let customers: TableName = "customers".into();
    writer
        .add_part(&orders, live(vec![order(1, 1, 10), order(2, 1, 20)]))
        .unwrap();
    writer
        .add_part(&customers, live(vec![customer(1, "ada")]))
        .unwrap();
    writer.add_part(&orders, live(vec![order(3, 2, 30)])).unwrap();
    writer
        .add_part(&customers, live(vec![customer(2, "bob")]))
        .unwrap();
    let info = writer.finish().unwrap();

    let order_seen: Vec<(String, u32)> = info
        .enumerate_parts(CyclePolicy::Fail)
        .unwrap()
        .map(|p| (p.table.to_string(), p.sequence))
        .collect();
    assert_eq!(
        order_seen,
        vec![
            ("customers".to_string(), 1),
            ("orders".to_string(), 1),
            ("orders".to_string(), 2),
        ]
    );

    // Enumeration restarts from the beginning.
    assert_eq!(info.enumerate_parts(CyclePolicy::Fail).unwrap().count(), 3);
}

#[test]
fn zero_row_tables_produce_no_parts() {
    let dir = tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig::new(dir.path()));
    let mut writer = engine.create_batch(&shop_schema()).unwrap();
    writer.add_part(&"orders".into(), Vec::new()).unwrap();
    writer
        .add_part(&"customers".into(), live(vec![customer(1, "ada")]))
        .unwrap();
    let info = writer.finish().unwrap();

    assert_eq!(info.tables(), vec![&TableName::from("customers")]);
    assert_eq!(info.parts.len(), 1);
    assert!(info.parts[0].is_last_batch);
}

#[test]
fn reload_from_manifest() {
    let dir = tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(1));
    let mut writer = engine.create_batch(&shop_schema()).unwrap();
    writer
        .add_part(
            &"customers".into(),
            live(vec![customer(1, "ada"), customer(2, "bob")]),
        )
        .unwrap();
    let info = writer.finish().unwrap();

    let reloaded = BatchInfo::load(&info.path()).unwrap();
    assert_eq!(reloaded, info);
    reloaded.ensure_complete().unwrap();
}

#[test]
fn tampered_part_is_detected() {
    let dir = tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig::new(dir.path()));
    let mut writer = engine.create_batch(&shop_schema()).unwrap();
    writer
        .add_part(&"customers".into(), live(vec![customer(1, "ada")]))
        .unwrap();
    let info = writer.finish().unwrap();

    let part_path = info.path().join(&info.parts[0].file_name);
    let mut data = fs::read(&part_path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&part_path, data).unwrap();

    let err = info.load_part(&info.parts[0]).unwrap_err();
    assert!(matches!(err, BatchError::ChecksumMismatch { .. }));
}

#[test]
fn missing_part_makes_batch_incomplete() {
    let dir = tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(1));
    let mut writer = engine.create_batch(&shop_schema()).unwrap();
    writer
        .add_part(
            &"customers".into(),
            live(vec![customer(1, "ada"), customer(2, "bob")]),
        )
        .unwrap();
    let info = writer.finish().unwrap();

    fs::remove_file(info.path().join(&info.parts[0].file_name)).unwrap();
    assert!(matches!(
        info.ensure_complete(),
        Err(BatchError::MissingPart { .. })
    ));
    assert!(BatchReader::new(&info, CyclePolicy::Fail).is_err());
}

#[test]
fn unfinished_batch_has_no_manifest() {
    let dir = tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(1));
    let mut writer = engine.create_batch(&shop_schema()).unwrap();
    writer
        .add_part(&"customers".into(), live(vec![customer(1, "ada")]))
        .unwrap();
    let path = writer.info().path();

    assert!(matches!(
        BatchInfo::load(&path),
        Err(BatchError::Incomplete { .. })
    ));
    writer.abort().unwrap();
    assert!(!path.exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn rows_survive_batching(
        rows in tracked_rows_strategy(people_table(), 0..120),
        batch_size in 1usize..40,
    ) {
        let dir = tempdir().unwrap();
        let table = people_table();
        let schema = rowsync_core::Schema::new(vec![table.clone()]).unwrap();
        let engine = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(batch_size));

        let mut writer = engine.create_batch(&schema).unwrap();
        writer.add_part(&table.name, rows.clone()).unwrap();
        let info = writer.finish().unwrap();

        prop_assert_eq!(info.row_count(), rows.len());
        let read: Vec<TrackedRow> = BatchReader::new(&info, CyclePolicy::Fail)
            .unwrap()
            .flat_map(|part| part.unwrap().1)
            .collect();
        prop_assert_eq!(read, rows);
    }
}
