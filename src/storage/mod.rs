//! Storage layer for the monitoring data model
//!
//! A uniform load/save contract over four heterogeneous targets, with
//! schema coercion and idempotent relational sync on top.
//!
//! ## Design
//!
//! - **Trait-based**: every target implements [`StorageBackend`]; adapters
//!   are built once by [`create_backend`] from an enumerated [`BackendKind`]
//! - **Async**: all operations are async and awaited inline by the caller
//! - **Absent is not an error**: missing tables, files and snapshots load as
//!   `Ok(None)`
//!
//! ## Backends
//!
//! - **Relational** (`relational`): Postgres or SQLite via sqlx, upsert sync
//!   through staging tables
//! - **Time-series** (`timeseries`): InfluxDB v2 HTTP API
//! - **File** (`file`): CSV files under the data drive
//! - **Streaming** (`streaming`): checksummed binary snapshots, one per stream
//!
//! ## Usage
//!
//! ```no_run
//! use structural_datastore::config::StoreConfig;
//! use structural_datastore::storage::{BackendKind, StorageHandler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StoreConfig::from_env();
//!     let handler = StorageHandler::connect(&config, &[BackendKind::File]).await?;
//!     let sensors = handler
//!         .load_table(BackendKind::File, "static_data/init_rdb/030_sensor_metadata")
//!         .await?;
//!     println!("{:?}", sensors.map(|s| s.len()));
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod dataset;
pub mod error;
pub mod file;
pub mod handler;
pub mod relational;
pub mod schema;
pub mod streaming;
pub mod timeseries;
pub mod value;

pub use backend::{BackendKind, SaveMode, StorageBackend, TimeRange, create_backend};
pub use dataset::{Column, Dataset, TIME_INDEX};
pub use error::{StorageError, StorageResult};
pub use handler::{IDENTITY_COLUMN, StorageHandler, split_tags};
pub use schema::{KeyKind, SchemaRegistry, TableSchema};
pub use value::{DataType, Value};
