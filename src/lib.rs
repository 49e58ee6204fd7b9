//! Storage abstraction for structural-monitoring data
//!
//! - [`storage`]: backend adapters (relational, time-series, file,
//!   streaming), schema coercion and the [`StorageHandler`] façade
//! - [`entities`]: the domain entity graph and [`DataManager`], which maps
//!   it onto tables and series
//! - [`actors`]: the background export worker
//! - [`config`]: connection settings from a JSON file or the environment

pub mod actors;
pub mod config;
pub mod entities;
pub mod storage;
pub mod util;

pub use config::{StoreConfig, read_config_file};
pub use entities::{DataManager, DynamicData, DynamicDataExporter, StaticData};
pub use storage::{BackendKind, Dataset, StorageError, StorageHandler, StorageResult, Value};
