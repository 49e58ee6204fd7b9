//! Storage handler
//!
//! Single entry point above the backend adapters. The handler owns the
//! connected adapters and the schema registry; it coerces datasets on the
//! way in and out and routes every call to the adapter of the requested
//! kind. Faults raised by an adapter come back wrapped in
//! `StorageError::Backend` with the kind and dataset id of the call;
//! `StorageError::root` recovers the adapter's own error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::backend::{BackendKind, SaveMode, StorageBackend, TimeRange, create_backend};
use super::dataset::Dataset;
use super::error::{StorageError, StorageResult};
use super::schema::SchemaRegistry;
use super::value::DataType;
use crate::config::StoreConfig;

/// Column that carries the synthetic record identity
pub const IDENTITY_COLUMN: &str = "id";

pub struct StorageHandler {
    datadrive: PathBuf,
    schemas: SchemaRegistry,
    backends: HashMap<BackendKind, Box<dyn StorageBackend>>,
}

impl StorageHandler {
    /// Handler without any connected backend
    pub fn new(datadrive: impl AsRef<Path>, schemas: SchemaRegistry) -> Self {
        Self {
            datadrive: datadrive.as_ref().to_path_buf(),
            schemas,
            backends: HashMap::new(),
        }
    }

    /// Build and connect an adapter for every kind in `kinds`.
    ///
    /// Fails on the first kind that cannot be constructed, so a
    /// misconfigured backend is reported before any data is touched.
    #[instrument(skip(config))]
    pub async fn connect(config: &StoreConfig, kinds: &[BackendKind]) -> StorageResult<Self> {
        let mut handler = Self::new(&config.datadrive, SchemaRegistry::builtin());
        for kind in kinds {
            if handler.backends.contains_key(kind) {
                continue;
            }
            let backend = create_backend(*kind, config).await?;
            info!("connected {} backend", kind);
            handler.backends.insert(*kind, backend);
        }
        Ok(handler)
    }

    /// Register (or replace) the adapter for its kind
    pub fn with_backend(mut self, backend: Box<dyn StorageBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn datadrive(&self) -> &Path {
        &self.datadrive
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Kinds with a connected adapter, in declaration order
    pub fn connected(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// The adapter for `kind`; a kind that was not connected is unsupported
    pub fn backend(&self, kind: BackendKind) -> StorageResult<&dyn StorageBackend> {
        self.backends
            .get(&kind)
            .map(|b| b.as_ref())
            .ok_or(StorageError::Unsupported {
                backend: kind,
                operation: "connect",
            })
    }

    /// Load a table, coerce it to its declaration and key it by its first
    /// column
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn load_table(&self, kind: BackendKind, id: &str) -> StorageResult<Option<Dataset>> {
        let loaded = self.backend(kind)?.load_table(id).await;
        let Some(dataset) = with_context(loaded, kind, id)? else {
            return Ok(None);
        };
        let mut dataset = self.schemas.coerce(id, dataset);
        dataset.set_first_column_as_index();
        debug!("loaded {} rows from {}", dataset.len(), id);
        Ok(Some(dataset))
    }

    /// Coerce and save a table; empty datasets are not written
    #[instrument(skip(self, dataset), fields(kind = %kind, rows = dataset.len()))]
    pub async fn save_table(
        &self,
        kind: BackendKind,
        id: &str,
        dataset: &Dataset,
        mode: SaveMode,
    ) -> StorageResult<()> {
        if dataset.is_empty() {
            debug!("nothing to save to {}", id);
            return Ok(());
        }
        let backend = self.backend(kind)?;
        let dataset = self.schemas.coerce(id, dataset.clone());
        with_context(backend.save_table(id, &dataset, mode).await, kind, id)
    }

    /// Save rows that carry an identity through `sync` and the rest through
    /// `append`, letting the backend assign their identities
    #[instrument(skip(self, dataset), fields(kind = %kind, rows = dataset.len()))]
    pub async fn save_records(
        &self,
        kind: BackendKind,
        id: &str,
        dataset: &Dataset,
    ) -> StorageResult<()> {
        let (existing, fresh) = dataset.split_by_identity(IDENTITY_COLUMN);
        debug!(
            "{}: {} existing, {} new records",
            id,
            existing.len(),
            fresh.len()
        );
        self.save_table(kind, id, &existing, SaveMode::Sync).await?;
        self.save_table(kind, id, &fresh, SaveMode::Append).await
    }

    /// Load a time-indexed dataset; every column that is not a tag is cast
    /// to float
    #[instrument(skip(self, tag_keys), fields(kind = %kind))]
    pub async fn load_time_series(
        &self,
        kind: BackendKind,
        id: &str,
        tag_keys: &[String],
        range: TimeRange,
    ) -> StorageResult<Option<Dataset>> {
        let loaded = self.backend(kind)?.load_time_series(id, range).await;
        let Some(mut dataset) = with_context(loaded, kind, id)? else {
            return Ok(None);
        };
        let pattern = tag_pattern(tag_keys)?;
        let fields: Vec<String> = dataset
            .column_names()
            .into_iter()
            .filter(|name| !is_tag(pattern.as_ref(), name))
            .map(str::to_string)
            .collect();
        for name in &fields {
            if let Some(column) = dataset.column_mut(name) {
                column.cast(DataType::Float);
            }
        }
        debug!("loaded {} rows from {}", dataset.len(), id);
        Ok(Some(dataset))
    }

    #[instrument(skip(self, dataset, tag_keys), fields(kind = %kind, rows = dataset.len()))]
    pub async fn save_time_series(
        &self,
        kind: BackendKind,
        id: &str,
        dataset: &Dataset,
        tag_keys: &[String],
    ) -> StorageResult<()> {
        if dataset.is_empty() {
            debug!("nothing to save to {}", id);
            return Ok(());
        }
        let saved = self
            .backend(kind)?
            .save_time_series(id, dataset, tag_keys)
            .await;
        with_context(saved, kind, id)
    }

    /// Create the declared tables on the relational backend
    pub async fn create_tables(&self) -> StorageResult<()> {
        let created = self
            .backend(BackendKind::Relational)?
            .create_tables(&self.schemas)
            .await;
        with_context(created, BackendKind::Relational, "declared tables")
    }

    pub async fn close(&self) -> StorageResult<()> {
        for backend in self.backends.values() {
            backend.close().await?;
        }
        Ok(())
    }
}

fn with_context<T>(result: StorageResult<T>, kind: BackendKind, id: &str) -> StorageResult<T> {
    result.map_err(|e| {
        warn!("{} backend failed on {}: {}", kind, id, e);
        e.context(kind, id)
    })
}

/// Anchored alternation of the escaped tag keys; `None` when there are no
/// tag keys, in which case nothing is a tag
fn tag_pattern(tag_keys: &[String]) -> StorageResult<Option<Regex>> {
    if tag_keys.is_empty() {
        return Ok(None);
    }
    let alternation: Vec<String> = tag_keys.iter().map(|k| regex::escape(k)).collect();
    Regex::new(&format!("^(?:{})", alternation.join("|")))
        .map(Some)
        .map_err(|e| StorageError::InvalidConfig(format!("invalid tag keys: {e}")))
}

fn is_tag(pattern: Option<&Regex>, name: &str) -> bool {
    pattern.is_some_and(|p| p.is_match(name))
}

/// Split a time-indexed dataset into `(fields, tags)`; both halves keep the
/// time index. A column is a tag when its name starts with one of
/// `tag_keys`.
pub fn split_tags(dataset: &Dataset, tag_keys: &[String]) -> StorageResult<(Dataset, Dataset)> {
    let pattern = tag_pattern(tag_keys)?;
    let (tags, fields) = dataset.split_columns(|name| is_tag(pattern.as_ref(), name));
    Ok((fields, tags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::storage::dataset::{Column, TIME_INDEX};
    use crate::storage::file::FileBackend;
    use crate::storage::streaming::StreamingBackend;
    use crate::storage::value::{Value, from_nanos};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn handler(root: &Path) -> StorageHandler {
        StorageHandler::new(root, SchemaRegistry::builtin())
            .with_backend(Box::new(FileBackend::new(root)))
            .with_backend(Box::new(StreamingBackend::new(root, RetryPolicy::default())))
    }

    fn tag_keys() -> Vec<String> {
        ["batch_id", "service_name", "batch_datetime"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn measurements(n: usize) -> Dataset {
        let rows = (0..n)
            .map(|i| {
                (
                    Value::Timestamp(from_nanos(1_587_772_800_000_000_000 + i as i64)),
                    vec![Value::Int(i as i64), Value::Float(0.25), Value::Int(9), "svc".into()],
                )
            })
            .collect();
        Dataset::from_rows(TIME_INDEX, &["0", "1", "batch_id", "service_name"], rows)
    }

    #[tokio::test]
    async fn test_unconnected_backend_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        assert_matches!(
            handler.load_table(BackendKind::Relational, "030_sensor_metadata").await,
            Err(StorageError::Unsupported { backend: BackendKind::Relational, .. })
        );
        assert_eq!(handler.connected(), vec![BackendKind::File, BackendKind::Streaming]);
    }

    #[tokio::test]
    async fn test_load_table_coerces_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        let id = "static_data/init_rdb/030_sensor_metadata";
        std::fs::create_dir_all(dir.path().join("static_data/init_rdb")).unwrap();
        std::fs::write(
            dir.path().join(format!("{id}.csv")),
            "sensor_name,locational,directional,note\nrosette,1,False,x\ngauge,,true,y\n",
        )
        .unwrap();

        let ds = handler.load_table(BackendKind::File, id).await.unwrap().unwrap();
        assert_eq!(ds.index_name(), Some("sensor_name"));
        assert_eq!(ds.column_names(), vec!["locational", "directional"]);
        assert_eq!(
            ds.column("locational").unwrap().values,
            vec![Value::Bool(true), Value::Null]
        );
    }

    #[tokio::test]
    async fn test_save_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        handler
            .save_table(BackendKind::File, "t", &Dataset::default(), SaveMode::Replace)
            .await
            .unwrap();
        assert!(!dir.path().join("t.csv").exists());
    }

    #[tokio::test]
    async fn test_save_drops_undeclared_index() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        let ds = Dataset::new(
            Some(Column::new("index", vec![Value::Int(0)])),
            vec![
                Column::new("instance_name", vec!["a".into()]),
                Column::new("data_name", vec!["b".into()]),
            ],
        );
        handler
            .save_table(BackendKind::File, "021_instance_inputs", &ds, SaveMode::Replace)
            .await
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("021_instance_inputs.csv")).unwrap();
        assert_eq!(text.lines().next(), Some("instance_name,data_name"));
    }

    #[tokio::test]
    async fn test_time_series_fields_are_floats() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        handler
            .save_time_series(BackendKind::Streaming, "s", &measurements(3), &tag_keys())
            .await
            .unwrap();

        let ds = handler
            .load_time_series(BackendKind::Streaming, "s", &tag_keys(), TimeRange::all())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ds.column("0").unwrap().values,
            vec![Value::Float(0.0), Value::Float(1.0), Value::Float(2.0)]
        );
        assert_eq!(ds.column("batch_id").unwrap().values, vec![Value::Int(9); 3]);
        assert_eq!(ds.column("service_name").unwrap().values[0], Value::from("svc"));
    }

    #[tokio::test]
    async fn test_backend_fault_carries_kind_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        let ds = Dataset::new(None, vec![Column::new("a", vec![Value::Int(1)])]);

        let err = handler
            .save_table(BackendKind::File, "t", &ds, SaveMode::Sync)
            .await
            .unwrap_err();
        assert_matches!(
            &err,
            StorageError::Backend { backend: BackendKind::File, id, .. } if id == "t"
        );
        assert_matches!(err.root(), StorageError::InvalidMode { backend: BackendKind::File, .. });
        assert!(err.to_string().starts_with("file backend failed on t: "));
    }

    #[test]
    fn test_tag_match_is_anchored_prefix() {
        let pattern = tag_pattern(&tag_keys()).unwrap();
        assert!(is_tag(pattern.as_ref(), "batch_id"));
        assert!(is_tag(pattern.as_ref(), "batch_datetime_utc"));
        assert!(!is_tag(pattern.as_ref(), "my_batch_id"));
        assert!(!is_tag(None, "batch_id"));
    }

    proptest! {
        #[test]
        fn prop_split_tags_then_join_restores(n in 1usize..40) {
            let ds = measurements(n);
            let (fields, tags) = split_tags(&ds, &tag_keys()).unwrap();
            prop_assert_eq!(fields.column_names(), vec!["0", "1"]);
            prop_assert_eq!(tags.column_names(), vec!["batch_id", "service_name"]);
            prop_assert_eq!(fields.join(&tags), ds);
        }
    }
}
