//! Entity mapper
//!
//! Translates between the entity graph and the tables of the storage layer.
//! Metadata lives in the relational tables (or in their CSV copies under
//! the data drive), while per-entity payloads such as sensor layouts,
//! connection tables and structural model components are always stored as
//! individual files.
//!
//! Saving follows the key kind of each table. On the relational backend,
//! naturally keyed metadata is upserted through `sync` and child records
//! are routed by identity (`sync` for rows with an `id`, `append` for the
//! rest). Every other backend rewrites the table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::dynamic_data::{
    BatchDependency, DynamicData, TimeSeriesBatchMetadata, TimeSeriesData, tag_keys,
};
use super::static_data::{
    InstanceIoMetadata, InstanceMetadata, Sensor, SensorInfo, ServiceMetadata, StaticData,
    StructuralModel, StructuralModelInfo, TimeSeriesMetadata,
};
use crate::actors::ExportSink;
use crate::storage::{
    BackendKind, Column, Dataset, SaveMode, StorageHandler, StorageResult, TimeRange, Value,
};

pub const SERVICE_METADATA: &str = "000_service_metadata";
pub const TIME_SERIES_BATCH_METADATA: &str = "001_time_series_batch_metadata";
pub const TIME_SERIES_BATCH_DEPENDENCIES: &str = "002_time_series_batch_dependencies";
pub const TIME_SERIES_METADATA: &str = "010_time_series_metadata";
pub const TIME_SERIES_STRUCTURAL_MODELS: &str = "011_time_series_structural_models";
pub const TIME_SERIES_SENSORS: &str = "013_time_series_sensors";
pub const INSTANCE_METADATA: &str = "020_instance_metadata";
pub const INSTANCE_INPUTS: &str = "021_instance_inputs";
pub const INSTANCE_OUTPUTS: &str = "022_instance_outputs";
pub const SENSOR_METADATA: &str = "030_sensor_metadata";
pub const SENSORS_STRUCTURAL_MODELS: &str = "032_sensors_structural_models";
pub const STRUCTURAL_MODEL_METADATA: &str = "040_structural_model_metadata";

/// Tables seeded from `static_data/init_rdb`
pub const STATIC_DATA_TABLES: [&str; 10] = [
    SERVICE_METADATA,
    TIME_SERIES_METADATA,
    TIME_SERIES_STRUCTURAL_MODELS,
    TIME_SERIES_SENSORS,
    INSTANCE_METADATA,
    INSTANCE_INPUTS,
    INSTANCE_OUTPUTS,
    SENSOR_METADATA,
    SENSORS_STRUCTURAL_MODELS,
    STRUCTURAL_MODEL_METADATA,
];

/// Tables seeded from `dynamic_data/init_rdb`
pub const DYNAMIC_DATA_TABLES: [&str; 2] = [TIME_SERIES_BATCH_METADATA, TIME_SERIES_BATCH_DEPENDENCIES];

const STATIC_INIT_DIR: &str = "static_data/init_rdb";
const DYNAMIC_INIT_DIR: &str = "dynamic_data/init_rdb";
const TIME_SERIES_INIT_DIR: &str = "dynamic_data/init_tsdb";
const STREAMING_DIR: &str = "dynamic_data/streaming_temp";

/// Storage id of a table or series for a backend kind
pub fn location(table: &str, kind: BackendKind) -> String {
    match kind {
        BackendKind::Relational | BackendKind::TimeSeries => table.to_string(),
        BackendKind::File if STATIC_DATA_TABLES.contains(&table) => {
            format!("{STATIC_INIT_DIR}/{table}")
        }
        BackendKind::File if DYNAMIC_DATA_TABLES.contains(&table) => {
            format!("{DYNAMIC_INIT_DIR}/{table}")
        }
        BackendKind::File => format!("{TIME_SERIES_INIT_DIR}/{table}"),
        BackendKind::Streaming => format!("{STREAMING_DIR}/{table}"),
    }
}

fn time_series_connection_path(data_name: &str, model_name: &str) -> String {
    format!("static_data/012_time_series_structural_model_connections/{data_name}_{model_name}")
}

fn sensor_path(sensor_name: &str) -> String {
    format!("static_data/031_sensors/{sensor_name}")
}

fn sensor_connection_path(sensor_name: &str, model_name: &str) -> String {
    format!("static_data/033_sensor_structural_model_connections/{sensor_name}_{model_name}")
}

fn model_component_path(model_name: &str, component: &str) -> String {
    format!("static_data/041_structural_models/{model_name}_{component}")
}

type Record = BTreeMap<String, Value>;

/// Rows as name/value maps, index included
fn records(dataset: &Dataset) -> Vec<Record> {
    let columns: Vec<&Column> = dataset.index().into_iter().chain(dataset.columns()).collect();
    (0..dataset.len())
        .map(|i| {
            columns
                .iter()
                .map(|c| (c.name.clone(), c.values[i].clone()))
                .collect()
        })
        .collect()
}

fn text(record: &Record, key: &str) -> Option<String> {
    record.get(key).and_then(Value::as_str).map(str::to_string)
}

fn integer(record: &Record, key: &str) -> Option<i64> {
    record.get(key).and_then(Value::as_i64)
}

fn group_by(rows: Vec<Record>, key: &str) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for row in rows {
        if let Some(value) = text(&row, key) {
            groups.entry(value).or_default().push(row);
        }
    }
    groups
}

/// Unkeyed dataset from row-major cells
fn flat(column_names: &[&str], rows: Vec<Vec<Value>>) -> Dataset {
    let mut columns: Vec<Column> = column_names
        .iter()
        .map(|name| Column::new(*name, Vec::with_capacity(rows.len())))
        .collect();
    for row in rows {
        for (column, cell) in columns.iter_mut().zip(row) {
            column.values.push(cell);
        }
    }
    Dataset::new(None, columns)
}

/// Maps the entity graph onto a [`StorageHandler`]
#[derive(Clone)]
pub struct DataManager {
    handler: Arc<StorageHandler>,
}

impl DataManager {
    pub fn new(handler: Arc<StorageHandler>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &StorageHandler {
        &self.handler
    }

    async fn load_records(&self, table: &str, kind: BackendKind) -> StorageResult<Vec<Record>> {
        Ok(self
            .handler
            .load_table(kind, &location(table, kind))
            .await?
            .map(|dataset| records(&dataset))
            .unwrap_or_default())
    }

    async fn load_file(&self, id: &str) -> StorageResult<Option<Dataset>> {
        self.handler.load_table(BackendKind::File, id).await
    }

    async fn save_file(&self, id: &str, dataset: &Dataset) -> StorageResult<()> {
        self.handler
            .save_table(BackendKind::File, id, dataset, SaveMode::Replace)
            .await
    }

    async fn save_keyed(&self, table: &str, kind: BackendKind, dataset: &Dataset) -> StorageResult<()> {
        let mode = match kind {
            BackendKind::Relational => SaveMode::Sync,
            _ => SaveMode::Replace,
        };
        self.handler
            .save_table(kind, &location(table, kind), dataset, mode)
            .await
    }

    async fn save_children(&self, table: &str, kind: BackendKind, dataset: &Dataset) -> StorageResult<()> {
        let id = location(table, kind);
        match kind {
            BackendKind::Relational => self.handler.save_records(kind, &id, dataset).await,
            _ => {
                self.handler
                    .save_table(kind, &id, dataset, SaveMode::Replace)
                    .await
            }
        }
    }

    /// Create the relational tables and seed them from the CSV files under
    /// `static_data/init_rdb` and `dynamic_data/init_rdb`. Files whose stem
    /// is not a declared table are skipped.
    #[instrument(skip(self))]
    pub async fn init_rdb(&self) -> StorageResult<()> {
        self.handler.create_tables().await?;
        for dir in [STATIC_INIT_DIR, DYNAMIC_INIT_DIR] {
            for stem in self.csv_stems(dir).await? {
                if self.handler.schemas().get(&stem).is_none() {
                    debug!("skipping {}/{}: not a declared table", dir, stem);
                    continue;
                }
                let Some(dataset) = self.load_file(&format!("{dir}/{stem}")).await? else {
                    continue;
                };
                info!("seeding {} with {} rows", stem, dataset.len());
                self.handler
                    .save_table(BackendKind::Relational, &stem, &dataset, SaveMode::Append)
                    .await?;
            }
        }
        Ok(())
    }

    /// Copy every series under `dynamic_data/init_tsdb` to `target`, named
    /// after its file stem
    #[instrument(skip(self), fields(target = %target))]
    pub async fn init_tsdb(&self, target: BackendKind) -> StorageResult<()> {
        let tag_keys = tag_keys();
        for stem in self.csv_stems(TIME_SERIES_INIT_DIR).await? {
            let Some(dataset) = self
                .handler
                .load_time_series(
                    BackendKind::File,
                    &format!("{TIME_SERIES_INIT_DIR}/{stem}"),
                    &tag_keys,
                    TimeRange::all(),
                )
                .await?
            else {
                continue;
            };
            info!("seeding series {} with {} rows", stem, dataset.len());
            self.handler
                .save_time_series(target, &location(&stem, target), &dataset, &tag_keys)
                .await?;
        }
        Ok(())
    }

    /// Sorted stems of the CSV files directly under `dir` (relative to the
    /// data drive); a missing directory has none
    async fn csv_stems(&self, dir: &str) -> StorageResult<Vec<String>> {
        let path = self.handler.datadrive().join(dir);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut stems = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "csv")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn import_static_data(&self, kind: BackendKind) -> StorageResult<StaticData> {
        let data = StaticData {
            service_metadata: self.import_service_metadata(kind).await?,
            time_series_metadata: self.import_time_series_metadata(kind).await?,
            instance_metadata: self.import_instance_metadata(kind).await?,
            sensors: self.import_sensors(kind).await?,
            structural_models: self.import_structural_models(kind).await?,
        };
        info!(
            services = data.service_metadata.len(),
            series = data.time_series_metadata.len(),
            instances = data.instance_metadata.len(),
            sensors = data.sensors.len(),
            models = data.structural_models.len(),
            "imported static data"
        );
        Ok(data)
    }

    async fn import_service_metadata(
        &self,
        kind: BackendKind,
    ) -> StorageResult<BTreeMap<String, ServiceMetadata>> {
        Ok(self
            .load_records(SERVICE_METADATA, kind)
            .await?
            .iter()
            .filter_map(|row| text(row, "service_name"))
            .map(|name| (name, ServiceMetadata))
            .collect())
    }

    async fn import_time_series_metadata(
        &self,
        kind: BackendKind,
    ) -> StorageResult<BTreeMap<String, TimeSeriesMetadata>> {
        let rows = self.load_records(TIME_SERIES_METADATA, kind).await?;
        if rows.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut model_links = group_by(
            self.load_records(TIME_SERIES_STRUCTURAL_MODELS, kind).await?,
            "data_name",
        );
        let mut sensor_links = group_by(self.load_records(TIME_SERIES_SENSORS, kind).await?, "data_name");

        let mut metadata = BTreeMap::new();
        for row in rows {
            let Some(data_name) = text(&row, "data_name") else {
                continue;
            };
            let mut structural_model_info = BTreeMap::new();
            for link in model_links.remove(&data_name).unwrap_or_default() {
                let Some(model_name) = text(&link, "structural_model_name") else {
                    continue;
                };
                let connection = self
                    .load_file(&time_series_connection_path(&data_name, &model_name))
                    .await?;
                structural_model_info.insert(
                    model_name,
                    StructuralModelInfo {
                        id: integer(&link, "id"),
                        component_name: text(&link, "component_name"),
                        connection,
                    },
                );
            }
            let sensor_info = sensor_links
                .remove(&data_name)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|link| {
                    let sensor_name = text(&link, "sensor_name")?;
                    Some((sensor_name, SensorInfo { id: integer(&link, "id") }))
                })
                .collect();
            metadata.insert(
                data_name,
                TimeSeriesMetadata {
                    coord_sys: text(&row, "coord_sys"),
                    sensor_info,
                    structural_model_info,
                },
            );
        }
        Ok(metadata)
    }

    async fn import_instance_metadata(
        &self,
        kind: BackendKind,
    ) -> StorageResult<BTreeMap<String, InstanceMetadata>> {
        let rows = self.load_records(INSTANCE_METADATA, kind).await?;
        if rows.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut inputs = group_by(self.load_records(INSTANCE_INPUTS, kind).await?, "instance_name");
        let mut outputs = group_by(self.load_records(INSTANCE_OUTPUTS, kind).await?, "instance_name");
        let io = |links: Vec<Record>| -> BTreeMap<String, InstanceIoMetadata> {
            links
                .into_iter()
                .filter_map(|link| {
                    let data_name = text(&link, "data_name")?;
                    Some((data_name, InstanceIoMetadata { id: integer(&link, "id") }))
                })
                .collect()
        };

        let mut metadata = BTreeMap::new();
        for row in rows {
            let Some(instance_name) = text(&row, "instance_name") else {
                continue;
            };
            let instance = InstanceMetadata {
                model_name: text(&row, "model_name").unwrap_or_default(),
                service_name: text(&row, "service_name").unwrap_or_default(),
                input_metadata: io(inputs.remove(&instance_name).unwrap_or_default()),
                output_metadata: io(outputs.remove(&instance_name).unwrap_or_default()),
            };
            metadata.insert(instance_name, instance);
        }
        Ok(metadata)
    }

    async fn import_sensors(&self, kind: BackendKind) -> StorageResult<BTreeMap<String, Sensor>> {
        let rows = self.load_records(SENSOR_METADATA, kind).await?;
        if rows.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut model_links = group_by(
            self.load_records(SENSORS_STRUCTURAL_MODELS, kind).await?,
            "sensor_name",
        );

        let mut sensors = BTreeMap::new();
        for row in rows {
            let Some(sensor_name) = text(&row, "sensor_name") else {
                continue;
            };
            let mut structural_model_info = BTreeMap::new();
            for link in model_links.remove(&sensor_name).unwrap_or_default() {
                let Some(model_name) = text(&link, "structural_model_name") else {
                    continue;
                };
                let connection = self
                    .load_file(&sensor_connection_path(&sensor_name, &model_name))
                    .await?;
                structural_model_info.insert(
                    model_name,
                    StructuralModelInfo {
                        id: integer(&link, "id"),
                        component_name: text(&link, "component_name"),
                        connection,
                    },
                );
            }
            let flag = |key: &str| row.get(key).and_then(Value::as_bool).unwrap_or(false);
            let sensor = Sensor {
                locational: flag("locational"),
                directional: flag("directional"),
                structural_model_info,
                data: self.load_file(&sensor_path(&sensor_name)).await?,
            };
            sensors.insert(sensor_name, sensor);
        }
        Ok(sensors)
    }

    async fn import_structural_models(
        &self,
        kind: BackendKind,
    ) -> StorageResult<BTreeMap<String, StructuralModel>> {
        let mut models = BTreeMap::new();
        for row in self.load_records(STRUCTURAL_MODEL_METADATA, kind).await? {
            let Some(model_name) = text(&row, "structural_model_name") else {
                continue;
            };
            let model_type = text(&row, "model_type").unwrap_or_default();
            let mut components = BTreeMap::new();
            for component in StructuralModel::component_names_of(&model_type).unwrap_or_default() {
                let dataset = self
                    .load_file(&model_component_path(&model_name, component))
                    .await?;
                components.insert(component.to_string(), dataset);
            }
            models.insert(
                model_name,
                StructuralModel::from_components(&model_type, components)?,
            );
        }
        Ok(models)
    }

    /// Save the whole static graph. Parents go first: services, structural
    /// models, sensors, time-series metadata, instances.
    #[instrument(skip(self, data), fields(kind = %kind))]
    pub async fn export_static_data(&self, data: &StaticData, kind: BackendKind) -> StorageResult<()> {
        self.export_service_metadata(&data.service_metadata, kind)
            .await?;
        self.export_structural_models(&data.structural_models, kind)
            .await?;
        self.export_sensors(&data.sensors, kind).await?;
        self.export_time_series_metadata(&data.time_series_metadata, kind)
            .await?;
        self.export_instance_metadata(&data.instance_metadata, kind)
            .await?;
        info!("exported static data");
        Ok(())
    }

    async fn export_service_metadata(
        &self,
        services: &BTreeMap<String, ServiceMetadata>,
        kind: BackendKind,
    ) -> StorageResult<()> {
        if services.is_empty() {
            return Ok(());
        }
        let rows = services
            .keys()
            .map(|name| (Value::from(name.as_str()), vec![]))
            .collect();
        let dataset = Dataset::from_rows("service_name", &[], rows);
        self.save_keyed(SERVICE_METADATA, kind, &dataset).await
    }

    async fn export_structural_models(
        &self,
        models: &BTreeMap<String, StructuralModel>,
        kind: BackendKind,
    ) -> StorageResult<()> {
        if models.is_empty() {
            return Ok(());
        }
        let rows = models
            .iter()
            .map(|(name, model)| (Value::from(name.as_str()), vec![Value::from(model.model_type())]))
            .collect();
        let metadata = Dataset::from_rows("structural_model_name", &["model_type"], rows);
        self.save_keyed(STRUCTURAL_MODEL_METADATA, kind, &metadata)
            .await?;

        for (name, model) in models {
            for (component, dataset) in model.components() {
                if let Some(dataset) = dataset {
                    self.save_file(&model_component_path(name, component), dataset)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn export_sensors(&self, sensors: &BTreeMap<String, Sensor>, kind: BackendKind) -> StorageResult<()> {
        if sensors.is_empty() {
            return Ok(());
        }
        let rows = sensors
            .iter()
            .map(|(name, sensor)| {
                (
                    Value::from(name.as_str()),
                    vec![Value::Bool(sensor.locational), Value::Bool(sensor.directional)],
                )
            })
            .collect();
        let metadata = Dataset::from_rows("sensor_name", &["locational", "directional"], rows);
        self.save_keyed(SENSOR_METADATA, kind, &metadata).await?;

        let mut links = Vec::new();
        for (sensor_name, sensor) in sensors {
            if let Some(data) = &sensor.data {
                self.save_file(&sensor_path(sensor_name), data).await?;
            }
            for (model_name, info) in &sensor.structural_model_info {
                links.push(vec![
                    Value::from(info.id),
                    Value::from(sensor_name.as_str()),
                    Value::from(model_name.as_str()),
                    Value::from(info.component_name.clone()),
                ]);
                if let Some(connection) = &info.connection {
                    self.save_file(&sensor_connection_path(sensor_name, model_name), connection)
                        .await?;
                }
            }
        }
        let links = flat(
            &["id", "sensor_name", "structural_model_name", "component_name"],
            links,
        );
        self.save_children(SENSORS_STRUCTURAL_MODELS, kind, &links)
            .await
    }

    async fn export_time_series_metadata(
        &self,
        metadata: &BTreeMap<String, TimeSeriesMetadata>,
        kind: BackendKind,
    ) -> StorageResult<()> {
        if metadata.is_empty() {
            return Ok(());
        }
        let rows = metadata
            .iter()
            .map(|(name, series)| (Value::from(name.as_str()), vec![Value::from(series.coord_sys.clone())]))
            .collect();
        let table = Dataset::from_rows("data_name", &["coord_sys"], rows);
        self.save_keyed(TIME_SERIES_METADATA, kind, &table).await?;

        let mut model_links = Vec::new();
        let mut sensor_links = Vec::new();
        for (data_name, series) in metadata {
            for (model_name, info) in &series.structural_model_info {
                model_links.push(vec![
                    Value::from(info.id),
                    Value::from(data_name.as_str()),
                    Value::from(model_name.as_str()),
                    Value::from(info.component_name.clone()),
                ]);
                if let Some(connection) = &info.connection {
                    self.save_file(&time_series_connection_path(data_name, model_name), connection)
                        .await?;
                }
            }
            for (sensor_name, info) in &series.sensor_info {
                sensor_links.push(vec![
                    Value::from(info.id),
                    Value::from(data_name.as_str()),
                    Value::from(sensor_name.as_str()),
                ]);
            }
        }
        let model_links = flat(
            &["id", "data_name", "structural_model_name", "component_name"],
            model_links,
        );
        self.save_children(TIME_SERIES_STRUCTURAL_MODELS, kind, &model_links)
            .await?;
        let sensor_links = flat(&["id", "data_name", "sensor_name"], sensor_links);
        self.save_children(TIME_SERIES_SENSORS, kind, &sensor_links)
            .await
    }

    async fn export_instance_metadata(
        &self,
        instances: &BTreeMap<String, InstanceMetadata>,
        kind: BackendKind,
    ) -> StorageResult<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let rows = instances
            .iter()
            .map(|(name, instance)| {
                (
                    Value::from(name.as_str()),
                    vec![
                        Value::from(instance.model_name.as_str()),
                        Value::from(instance.service_name.as_str()),
                    ],
                )
            })
            .collect();
        let table = Dataset::from_rows("instance_name", &["model_name", "service_name"], rows);
        self.save_keyed(INSTANCE_METADATA, kind, &table).await?;

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for (instance_name, instance) in instances {
            let row = |data_name: &str, io: &InstanceIoMetadata| {
                vec![
                    Value::from(io.id),
                    Value::from(instance_name.as_str()),
                    Value::from(data_name),
                ]
            };
            for (data_name, io) in &instance.input_metadata {
                inputs.push(row(data_name, io));
            }
            for (data_name, io) in &instance.output_metadata {
                outputs.push(row(data_name, io));
            }
        }
        let columns = ["id", "instance_name", "data_name"];
        self.save_children(INSTANCE_INPUTS, kind, &flat(&columns, inputs))
            .await?;
        self.save_children(INSTANCE_OUTPUTS, kind, &flat(&columns, outputs))
            .await
    }

    /// Load the named series from `ts_kind` (names without a stored series
    /// are left out) and, when `import_metadata` is set, the batch metadata
    /// from `table_kind`
    #[instrument(skip(self, names), fields(table_kind = %table_kind, ts_kind = %ts_kind))]
    pub async fn import_dynamic_data(
        &self,
        names: &[String],
        table_kind: BackendKind,
        ts_kind: BackendKind,
        range: TimeRange,
        import_metadata: bool,
    ) -> StorageResult<DynamicData> {
        let tag_keys = tag_keys();
        let mut data = DynamicData::default();
        for name in names {
            let Some(dataset) = self
                .handler
                .load_time_series(ts_kind, &location(name, ts_kind), &tag_keys, range)
                .await?
            else {
                debug!("no series stored for {}", name);
                continue;
            };
            data.time_series_data
                .insert(name.clone(), TimeSeriesData::from_combined(&dataset)?);
        }
        if import_metadata {
            data.time_series_batch_metadata = self.import_batch_metadata(table_kind).await?;
        }
        Ok(data)
    }

    async fn import_batch_metadata(
        &self,
        kind: BackendKind,
    ) -> StorageResult<BTreeMap<i64, TimeSeriesBatchMetadata>> {
        let rows = self.load_records(TIME_SERIES_BATCH_METADATA, kind).await?;
        if rows.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut dependencies: BTreeMap<i64, BTreeMap<i64, BatchDependency>> = BTreeMap::new();
        for row in self.load_records(TIME_SERIES_BATCH_DEPENDENCIES, kind).await? {
            let (Some(batch_id), Some(dependent_batch_id)) =
                (integer(&row, "batch_id"), integer(&row, "dependent_batch_id"))
            else {
                continue;
            };
            dependencies
                .entry(batch_id)
                .or_default()
                .insert(dependent_batch_id, BatchDependency { id: integer(&row, "id") });
        }

        let mut batches = BTreeMap::new();
        for row in rows {
            let Some(id) = integer(&row, "id") else {
                continue;
            };
            batches.insert(
                id,
                TimeSeriesBatchMetadata {
                    service_name: text(&row, "service_name").unwrap_or_default(),
                    batch_datetime: row.get("batch_datetime").and_then(Value::as_timestamp),
                    dependencies: dependencies.remove(&id).unwrap_or_default(),
                },
            );
        }
        Ok(batches)
    }

    /// Save the named series (fields joined with tags) to `ts_kind`, then
    /// all batch metadata to `table_kind`
    #[instrument(skip(self, data, names), fields(table_kind = %table_kind, ts_kind = %ts_kind))]
    pub async fn export_dynamic_data(
        &self,
        data: &DynamicData,
        names: &[String],
        table_kind: BackendKind,
        ts_kind: BackendKind,
    ) -> StorageResult<()> {
        let tag_keys = tag_keys();
        for name in names {
            let Some(series) = data.time_series_data.get(name) else {
                warn!("no series named {} to export", name);
                continue;
            };
            self.handler
                .save_time_series(ts_kind, &location(name, ts_kind), &series.combined(), &tag_keys)
                .await?;
        }
        self.export_batch_metadata(&data.time_series_batch_metadata, table_kind)
            .await
    }

    async fn export_batch_metadata(
        &self,
        batches: &BTreeMap<i64, TimeSeriesBatchMetadata>,
        kind: BackendKind,
    ) -> StorageResult<()> {
        if batches.is_empty() {
            return Ok(());
        }
        let rows = batches
            .iter()
            .map(|(id, batch)| {
                (
                    Value::Int(*id),
                    vec![
                        Value::from(batch.service_name.as_str()),
                        Value::from(batch.batch_datetime),
                    ],
                )
            })
            .collect();
        let metadata = Dataset::from_rows("id", &["service_name", "batch_datetime"], rows);
        self.save_keyed(TIME_SERIES_BATCH_METADATA, kind, &metadata)
            .await?;

        let dependencies = batches
            .iter()
            .flat_map(|(batch_id, batch)| {
                batch.dependencies.iter().map(|(dependent_batch_id, dependency)| {
                    vec![
                        Value::from(dependency.id),
                        Value::Int(*batch_id),
                        Value::Int(*dependent_batch_id),
                    ]
                })
            })
            .collect();
        let dependencies = flat(&["id", "batch_id", "dependent_batch_id"], dependencies);
        self.save_children(TIME_SERIES_BATCH_DEPENDENCIES, kind, &dependencies)
            .await
    }
}

/// Export sink that hands queued [`DynamicData`] to a [`DataManager`]; the
/// stream id of each item is the name of the series to save
#[derive(Clone)]
pub struct DynamicDataExporter {
    manager: DataManager,
    table_kind: BackendKind,
    ts_kind: BackendKind,
}

impl DynamicDataExporter {
    pub fn new(manager: DataManager, table_kind: BackendKind, ts_kind: BackendKind) -> Self {
        Self {
            manager,
            table_kind,
            ts_kind,
        }
    }
}

#[async_trait]
impl ExportSink<DynamicData> for DynamicDataExporter {
    async fn export(&self, stream_id: &str, payload: DynamicData) -> StorageResult<()> {
        self.manager
            .export_dynamic_data(
                &payload,
                &[stream_id.to_string()],
                self.table_kind,
                self.ts_kind,
            )
            .await
    }
}
