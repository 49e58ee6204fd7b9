//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait that the relational,
//! time-series, file and streaming adapters implement, plus the enumerated
//! backend kind used to construct them.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::dataset::Dataset;
use super::error::{StorageError, StorageResult};
use super::schema::SchemaRegistry;
use crate::config::StoreConfig;

/// The four supported storage targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Relational,
    TimeSeries,
    File,
    Streaming,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Relational,
        BackendKind::TimeSeries,
        BackendKind::File,
        BackendKind::Streaming,
    ];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::TimeSeries => write!(f, "timeseries"),
            BackendKind::File => write!(f, "file"),
            BackendKind::Streaming => write!(f, "streaming"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" | "sqlite" | "rdb" => {
                Ok(BackendKind::Relational)
            }
            "timeseries" | "time_series" | "influx" | "influxdb" | "tsdb" => {
                Ok(BackendKind::TimeSeries)
            }
            "file" => Ok(BackendKind::File),
            "streaming" => Ok(BackendKind::Streaming),
            other => Err(StorageError::InvalidConfig(format!(
                "unknown backend '{}', expected one of relational, timeseries, file, streaming",
                other
            ))),
        }
    }
}

/// How `save_table` reconciles data with what is already stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Blind insert
    Append,
    /// Full overwrite (file backend only)
    Replace,
    /// Upsert keyed on the dataset index (relational backend only)
    Sync,
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveMode::Append => write!(f, "append"),
            SaveMode::Replace => write!(f, "replace"),
            SaveMode::Sync => write!(f, "sync"),
        }
    }
}

impl FromStr for SaveMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(SaveMode::Append),
            "replace" => Ok(SaveMode::Replace),
            "sync" => Ok(SaveMode::Sync),
            other => Err(StorageError::InvalidConfig(format!(
                "unknown save mode '{}'",
                other
            ))),
        }
    }
}

/// Half-open time window `[start, end)`; open bounds are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, t: Option<NaiveDateTime>) -> bool {
        super::dataset::in_range(t, self.start, self.end)
    }
}

/// Trait for storage adapters
///
/// Every adapter implements the subset of the four operations its target
/// supports; the defaults fail with `StorageError::Unsupported`.
///
/// ## Conventions
///
/// - `load_table` returns flat columns (no index); the caller promotes the
///   first column to the key.
/// - A missing table, file or snapshot is `Ok(None)`, never an error.
/// - Time-series loads return a dataset indexed by naive timestamps named
///   `time`.
/// - Backend faults are returned unchanged; adapters never retry them.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared between the
/// caller's tasks and the export worker.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which target this adapter talks to
    fn kind(&self) -> BackendKind;

    async fn load_table(&self, _id: &str) -> StorageResult<Option<Dataset>> {
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "load_table",
        })
    }

    /// Persist `dataset`. Empty datasets are a no-op.
    async fn save_table(&self, _id: &str, _dataset: &Dataset, _mode: SaveMode) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "save_table",
        })
    }

    async fn load_time_series(&self, _id: &str, _range: TimeRange) -> StorageResult<Option<Dataset>> {
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "load_time_series",
        })
    }

    async fn save_time_series(
        &self,
        _id: &str,
        _dataset: &Dataset,
        _tag_keys: &[String],
    ) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "save_time_series",
        })
    }

    /// Create every declared table that does not exist yet
    async fn create_tables(&self, _schemas: &SchemaRegistry) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "create_tables",
        })
    }

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Build the adapter for `kind` from configuration
pub async fn create_backend(
    kind: BackendKind,
    config: &StoreConfig,
) -> StorageResult<Box<dyn StorageBackend>> {
    let backend: Box<dyn StorageBackend> = match kind {
        BackendKind::Relational => {
            let url = config.relational_url()?;
            Box::new(super::relational::RelationalBackend::connect(&url).await?)
        }
        BackendKind::TimeSeries => Box::new(super::timeseries::TimeSeriesBackend::new(
            config.influx_settings()?,
        )?),
        BackendKind::File => Box::new(super::file::FileBackend::new(&config.datadrive)),
        BackendKind::Streaming => Box::new(super::streaming::StreamingBackend::new(
            &config.datadrive,
            config.streaming.retry_policy(),
        )),
    };
    Ok(backend)
}
