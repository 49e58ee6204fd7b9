//! Relational sync and identity routing on SQLite

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use structural_datastore::storage::{
    BackendKind, Column, Dataset, SaveMode, StorageError, StorageHandler, Value,
};

use crate::helpers::sqlite_handler;

const TABLE: &str = "013_time_series_sensors";

fn links(rows: &[(Option<i64>, &str)]) -> Dataset {
    Dataset::new(
        None,
        vec![
            Column::new("id", rows.iter().map(|(id, _)| Value::from(*id)).collect()),
            Column::new("data_name", vec![Value::from("acc"); rows.len()]),
            Column::new(
                "sensor_name",
                rows.iter().map(|(_, sensor)| Value::from(*sensor)).collect(),
            ),
        ],
    )
}

async fn stored(handler: &StorageHandler) -> Vec<(i64, String)> {
    let mut dataset = handler
        .load_table(BackendKind::Relational, TABLE)
        .await
        .unwrap()
        .unwrap();
    dataset.sort_by_index();
    let ids = &dataset.index().unwrap().values;
    let sensors = &dataset.column("sensor_name").unwrap().values;
    ids.iter()
        .zip(sensors)
        .map(|(id, sensor)| {
            (
                id.as_i64().unwrap(),
                sensor.as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_records_without_identity_are_assigned_one() {
    let dir = tempfile::tempdir().unwrap();
    let handler = sqlite_handler(dir.path()).await;

    handler
        .save_records(BackendKind::Relational, TABLE, &links(&[(None, "rosette"), (None, "gauge")]))
        .await
        .unwrap();

    assert_eq!(
        stored(&handler).await,
        vec![(1, "rosette".to_string()), (2, "gauge".to_string())]
    );
}

#[tokio::test]
async fn test_mixed_records_update_and_insert() {
    let dir = tempfile::tempdir().unwrap();
    let handler = sqlite_handler(dir.path()).await;
    handler
        .save_records(BackendKind::Relational, TABLE, &links(&[(None, "rosette"), (None, "gauge")]))
        .await
        .unwrap();

    handler
        .save_records(
            BackendKind::Relational,
            TABLE,
            &links(&[(Some(1), "rosette-2"), (None, "strain")]),
        )
        .await
        .unwrap();

    assert_eq!(
        stored(&handler).await,
        vec![
            (1, "rosette-2".to_string()),
            (2, "gauge".to_string()),
            (3, "strain".to_string())
        ]
    );
}

#[tokio::test]
async fn test_sync_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let handler = sqlite_handler(dir.path()).await;
    let batch = links(&[(Some(10), "rosette"), (Some(11), "gauge")]);

    for _ in 0..2 {
        handler
            .save_records(BackendKind::Relational, TABLE, &batch)
            .await
            .unwrap();
    }

    assert_eq!(
        stored(&handler).await,
        vec![(10, "rosette".to_string()), (11, "gauge".to_string())]
    );
}

#[tokio::test]
async fn test_natural_key_sync_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let handler = sqlite_handler(dir.path()).await;
    let sensors = |locational: bool| {
        Dataset::from_rows(
            "sensor_name",
            &["locational", "directional"],
            vec![(Value::from("rosette"), vec![Value::Bool(locational), Value::Bool(true)])],
        )
    };

    handler
        .save_table(BackendKind::Relational, "030_sensor_metadata", &sensors(false), SaveMode::Sync)
        .await
        .unwrap();
    handler
        .save_table(BackendKind::Relational, "030_sensor_metadata", &sensors(true), SaveMode::Sync)
        .await
        .unwrap();

    let loaded = handler
        .load_table(BackendKind::Relational, "030_sensor_metadata")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, sensors(true));
}

#[tokio::test]
async fn test_replace_is_not_a_relational_mode() {
    let dir = tempfile::tempdir().unwrap();
    let handler = sqlite_handler(dir.path()).await;

    let err = handler
        .save_table(BackendKind::Relational, TABLE, &links(&[(Some(1), "a")]), SaveMode::Replace)
        .await
        .unwrap_err();
    assert_matches!(
        err.root(),
        StorageError::InvalidMode { backend: BackendKind::Relational, .. }
    );
    assert_matches!(err, StorageError::Backend { ref id, .. } if id == TABLE);
}
