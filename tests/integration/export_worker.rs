//! Export worker writing dynamic data through the data manager

use std::collections::BTreeMap;
use std::time::Duration;

use pretty_assertions::assert_eq;
use structural_datastore::actors::{ExportWorker, WorkerState};
use structural_datastore::entities::{
    DynamicData, DynamicDataExporter, TimeSeriesBatchMetadata, TimeSeriesData,
};
use structural_datastore::storage::{BackendKind, TimeRange};

use crate::helpers::{at, manager, readings, sqlite_handler};

fn payload(name: &str, batch_id: i64, rows: usize) -> DynamicData {
    let mut data = DynamicData::default();
    data.time_series_data.insert(
        name.to_string(),
        TimeSeriesData::from_combined(&readings(rows, batch_id)).unwrap(),
    );
    data.time_series_batch_metadata.insert(
        batch_id,
        TimeSeriesBatchMetadata {
            service_name: "monitoring".into(),
            batch_datetime: Some(at(0)),
            dependencies: BTreeMap::new(),
        },
    );
    data
}

#[tokio::test]
async fn test_worker_drains_into_storage() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(sqlite_handler(dir.path()).await);
    let sink = DynamicDataExporter::new(manager.clone(), BackendKind::Relational, BackendKind::Streaming);
    let handle = ExportWorker::spawn(sink, Duration::from_millis(20));
    let mut states = handle.subscribe();

    handle.enqueue("acc", payload("acc", 1, 12)).unwrap();
    handle.enqueue("strain", payload("strain", 2, 4)).unwrap();
    // a later payload for the same stream replaces the snapshot
    handle.enqueue("acc", payload("acc", 3, 6)).unwrap();
    handle.request_stop();

    assert_eq!(handle.join().await.unwrap(), 3);
    assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);

    let names = vec!["acc".to_string(), "strain".to_string()];
    let imported = manager
        .import_dynamic_data(
            &names,
            BackendKind::Relational,
            BackendKind::Streaming,
            TimeRange::all(),
            true,
        )
        .await
        .unwrap();

    assert_eq!(imported.time_series_data["acc"].combined(), readings(6, 3));
    assert_eq!(imported.time_series_data["strain"].combined(), readings(4, 2));
    assert_eq!(
        imported.time_series_batch_metadata.keys().copied().collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn test_failed_payload_does_not_block_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(sqlite_handler(dir.path()).await);
    // the time-series backend is not connected, so series exports fail
    let failing = DynamicDataExporter::new(manager.clone(), BackendKind::Relational, BackendKind::TimeSeries);
    let handle = ExportWorker::spawn(failing, Duration::from_millis(20));

    handle.enqueue("acc", payload("acc", 1, 3)).unwrap();
    handle.enqueue("missing", DynamicData::default()).unwrap();
    handle.request_stop();
    assert_eq!(handle.join().await.unwrap(), 2);

    let imported = manager
        .import_dynamic_data(&[], BackendKind::Relational, BackendKind::Streaming, TimeRange::all(), true)
        .await
        .unwrap();
    assert!(imported.time_series_batch_metadata.is_empty());
}
