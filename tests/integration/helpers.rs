//! Shared builders for integration tests

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use structural_datastore::{
    DataManager, StorageHandler,
    config::RetryPolicy,
    storage::{
        Dataset, SchemaRegistry, TIME_INDEX, Value, file::FileBackend,
        relational::RelationalBackend, streaming::StreamingBackend, value::from_nanos,
    },
};

/// 2020-04-25 00:00:00 in nanoseconds
pub const START_NS: i64 = 1_587_772_800_000_000_000;

pub fn at(second: i64) -> NaiveDateTime {
    from_nanos(START_NS + second * 1_000_000_000)
}

/// Handler with the file and streaming backends rooted at `root`
pub fn local_handler(root: &Path) -> StorageHandler {
    StorageHandler::new(root, SchemaRegistry::builtin())
        .with_backend(Box::new(FileBackend::new(root)))
        .with_backend(Box::new(StreamingBackend::new(root, RetryPolicy::default())))
}

/// Local handler plus a SQLite database under `root` with the built-in
/// tables created
pub async fn sqlite_handler(root: &Path) -> StorageHandler {
    let url = format!("sqlite://{}?mode=rwc", root.join("store.db").display());
    let relational = RelationalBackend::connect(&url).await.unwrap();
    let handler = local_handler(root).with_backend(Box::new(relational));
    handler.create_tables().await.unwrap();
    handler
}

pub fn manager(handler: StorageHandler) -> DataManager {
    DataManager::new(Arc::new(handler))
}

/// `rows` points keyed by `data_id` with `x`, `y`, `z` coordinates
pub fn points(rows: usize) -> Dataset {
    Dataset::from_rows(
        "data_id",
        &["x", "y", "z"],
        (0..rows)
            .map(|i| {
                let i = i as f64;
                (
                    Value::Int(i as i64),
                    vec![Value::Float(i * 0.5), Value::Float(-i), Value::Float(1.25)],
                )
            })
            .collect(),
    )
}

/// One reading per second starting at [`START_NS`], tagged with `batch_id`
pub fn readings(rows: usize, batch_id: i64) -> Dataset {
    Dataset::from_rows(
        TIME_INDEX,
        &["0", "1", "batch_id"],
        (0..rows)
            .map(|i| {
                (
                    Value::Timestamp(at(i as i64)),
                    vec![
                        Value::Float(i as f64),
                        Value::Float(i as f64 * 2.0),
                        Value::Int(batch_id),
                    ],
                )
            })
            .collect(),
    )
}
