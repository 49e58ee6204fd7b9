//! File and streaming backends through the storage handler

use pretty_assertions::assert_eq;
use structural_datastore::storage::{BackendKind, SaveMode, TimeRange, Value};

use crate::helpers::{at, local_handler, points, readings};

#[tokio::test]
async fn test_table_round_trip_keeps_key_and_columns() {
    let dir = tempfile::tempdir().unwrap();
    let handler = local_handler(dir.path());
    let id = "static_data/031_sensors/rosette";

    handler
        .save_table(BackendKind::File, id, &points(18), SaveMode::Replace)
        .await
        .unwrap();
    let loaded = handler
        .load_table(BackendKind::File, id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(loaded.len(), 18);
    assert_eq!(loaded.index_name(), Some("data_id"));
    assert_eq!(loaded.column_names(), vec!["x", "y", "z"]);
    assert_eq!(loaded, points(18));
}

#[tokio::test]
async fn test_replace_overwrites_previous_table() {
    let dir = tempfile::tempdir().unwrap();
    let handler = local_handler(dir.path());
    let id = "static_data/031_sensors/gauge";

    handler
        .save_table(BackendKind::File, id, &points(18), SaveMode::Replace)
        .await
        .unwrap();
    handler
        .save_table(BackendKind::File, id, &points(4), SaveMode::Replace)
        .await
        .unwrap();

    let loaded = handler.load_table(BackendKind::File, id).await.unwrap().unwrap();
    assert_eq!(loaded.len(), 4);
}

#[tokio::test]
async fn test_series_range_excludes_leading_rows() {
    let dir = tempfile::tempdir().unwrap();
    let handler = local_handler(dir.path());
    let id = "dynamic_data/init_tsdb/acc";
    let tag_keys = vec!["batch_id".to_string()];

    handler
        .save_time_series(BackendKind::File, id, &readings(12, 1), &tag_keys)
        .await
        .unwrap();

    let bounded = handler
        .load_time_series(BackendKind::File, id, &tag_keys, TimeRange::new(Some(at(5)), None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bounded.len(), 7);

    let unbounded = handler
        .load_time_series(BackendKind::File, id, &tag_keys, TimeRange::all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unbounded.len(), 12);
    assert_eq!(bounded, unbounded.filter_time_range(Some(at(5)), None));
}

#[tokio::test]
async fn test_series_appends_grow_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let handler = local_handler(dir.path());
    let id = "dynamic_data/init_tsdb/strain";
    let tag_keys = vec!["batch_id".to_string()];

    let first = readings(3, 1);
    let second = readings(6, 2).filter_time_range(Some(at(3)), None);
    for part in [&first, &second] {
        handler
            .save_time_series(BackendKind::File, id, part, &tag_keys)
            .await
            .unwrap();
    }

    let loaded = handler
        .load_time_series(BackendKind::File, id, &tag_keys, TimeRange::all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.len(), 6);
    assert_eq!(
        loaded.column("batch_id").unwrap().values,
        vec![
            Value::Int(1),
            Value::Int(1),
            Value::Int(1),
            Value::Int(2),
            Value::Int(2),
            Value::Int(2)
        ]
    );
}

#[tokio::test]
async fn test_streaming_snapshot_replaces_and_ignores_range() {
    let dir = tempfile::tempdir().unwrap();
    let handler = local_handler(dir.path());
    let id = "dynamic_data/streaming_temp/acc";
    let tag_keys = vec!["batch_id".to_string()];

    handler
        .save_time_series(BackendKind::Streaming, id, &readings(12, 1), &tag_keys)
        .await
        .unwrap();
    handler
        .save_time_series(BackendKind::Streaming, id, &readings(5, 2), &tag_keys)
        .await
        .unwrap();

    let loaded = handler
        .load_time_series(BackendKind::Streaming, id, &tag_keys, TimeRange::new(Some(at(3)), None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, readings(5, 2));
}

#[tokio::test]
async fn test_missing_resources_are_absent() {
    let dir = tempfile::tempdir().unwrap();
    let handler = local_handler(dir.path());

    assert!(handler.load_table(BackendKind::File, "nope").await.unwrap().is_none());
    assert!(
        handler
            .load_time_series(BackendKind::Streaming, "nope", &[], TimeRange::all())
            .await
            .unwrap()
            .is_none()
    );
}
