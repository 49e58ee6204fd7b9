//! Domain entities of the monitoring data model and their mapping onto
//! storage
//!
//! Static data describes the monitored structure (services, sensors,
//! structural models, which series exist and who consumes them). Dynamic
//! data carries the measurements themselves together with batch
//! bookkeeping. [`DataManager`] moves both between memory and any connected
//! backend.

pub mod dynamic_data;
pub mod manager;
pub mod static_data;

pub use dynamic_data::{
    BatchDependency, DynamicData, TAG_KEYS, TimeSeriesBatchMetadata, TimeSeriesData, tag_keys,
};
pub use manager::{DataManager, DynamicDataExporter, location};
pub use static_data::{
    InstanceIoMetadata, InstanceMetadata, Sensor, SensorInfo, ServiceMetadata, StaticData,
    StructuralModel, StructuralModelInfo, TimeSeriesMetadata,
};
