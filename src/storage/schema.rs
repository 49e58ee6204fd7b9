//! Table declarations and schema coercion
//!
//! Every relational table of the monitoring data model is declared here with
//! its column types and key kind. Coercion is pure: it drops undeclared
//! columns, casts declared ones, and turns anything unconvertible into
//! `Value::Null`. Tables without a declaration pass through untouched.
//!
//! Lookups use the table *stem* (last segment of an id such as
//! `static_data/init_rdb/030_sensor_metadata`), so file copies of relational
//! tables are coerced exactly like the tables themselves.

use std::collections::HashMap;

use super::dataset::Dataset;
use super::value::DataType;

/// How rows of a table are identified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The first column is a natural text key (`sensor_name`, ...)
    Natural,
    /// `id` is assigned by the backend on insert
    Synthetic,
}

/// Declared shape of one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub key: KeyKind,
    /// Declared columns in table order; the first one is the key
    pub columns: Vec<(String, DataType)>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key: KeyKind, columns: &[(&str, DataType)]) -> Self {
        Self {
            name: name.into(),
            key,
            columns: columns
                .iter()
                .map(|(n, t)| (n.to_string(), *t))
                .collect(),
        }
    }

    pub fn key_column(&self) -> &str {
        &self.columns[0].0
    }

    pub fn type_of(&self, column: &str) -> Option<DataType> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, ty)| *ty)
    }
}

/// Per-table column declarations used for coercion and DDL
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: HashMap<String, TableSchema>,
}

impl SchemaRegistry {
    /// Registry without any declarations (everything passes through)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in monitoring tables
    pub fn builtin() -> Self {
        builtin_tables()
            .into_iter()
            .fold(Self::empty(), |registry, table| registry.with_table(table))
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Declaration for `id`, looked up by its stem
    pub fn get(&self, id: &str) -> Option<&TableSchema> {
        self.tables.get(table_stem(id))
    }

    /// Declarations in name order (which is also dependency order, as the
    /// table names carry their numeric prefix)
    pub fn tables(&self) -> Vec<&TableSchema> {
        let mut tables: Vec<&TableSchema> = self.tables.values().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    /// Coerce `dataset` to the declaration of `id`.
    ///
    /// The index is treated like any other column: cast when declared and
    /// dropped when the table is known but the index is not part of it.
    pub fn coerce(&self, id: &str, mut dataset: Dataset) -> Dataset {
        let Some(schema) = self.get(id) else {
            return dataset;
        };

        if let Some(index_name) = dataset.index_name()
            && schema.type_of(index_name).is_none()
        {
            dataset.drop_index();
        }
        dataset.retain_columns(|name| schema.type_of(name).is_some());

        for column in dataset.all_columns_mut() {
            if let Some(ty) = schema.type_of(&column.name) {
                column.cast(ty);
            }
        }
        dataset
    }
}

/// Last path segment of an id, without extension
pub fn table_stem(id: &str) -> &str {
    let name = id.rsplit(['/', '\\']).next().unwrap_or(id);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

fn builtin_tables() -> Vec<TableSchema> {
    use DataType::*;
    use KeyKind::*;

    vec![
        TableSchema::new("000_service_metadata", Natural, &[("service_name", Str)]),
        TableSchema::new(
            "001_time_series_batch_metadata",
            Synthetic,
            &[
                ("id", Int),
                ("service_name", Str),
                ("batch_datetime", Timestamp),
            ],
        ),
        TableSchema::new(
            "002_time_series_batch_dependencies",
            Synthetic,
            &[("id", Int), ("batch_id", Int), ("dependent_batch_id", Int)],
        ),
        TableSchema::new(
            "010_time_series_metadata",
            Natural,
            &[("data_name", Str), ("coord_sys", Str)],
        ),
        TableSchema::new(
            "011_time_series_structural_models",
            Synthetic,
            &[
                ("id", Int),
                ("data_name", Str),
                ("structural_model_name", Str),
                ("component_name", Str),
            ],
        ),
        TableSchema::new(
            "013_time_series_sensors",
            Synthetic,
            &[("id", Int), ("data_name", Str), ("sensor_name", Str)],
        ),
        TableSchema::new(
            "020_instance_metadata",
            Natural,
            &[
                ("instance_name", Str),
                ("model_name", Str),
                ("service_name", Str),
            ],
        ),
        TableSchema::new(
            "021_instance_inputs",
            Synthetic,
            &[("id", Int), ("instance_name", Str), ("data_name", Str)],
        ),
        TableSchema::new(
            "022_instance_outputs",
            Synthetic,
            &[("id", Int), ("instance_name", Str), ("data_name", Str)],
        ),
        TableSchema::new(
            "030_sensor_metadata",
            Natural,
            &[
                ("sensor_name", Str),
                ("locational", Bool),
                ("directional", Bool),
            ],
        ),
        TableSchema::new(
            "032_sensors_structural_models",
            Synthetic,
            &[
                ("id", Int),
                ("sensor_name", Str),
                ("structural_model_name", Str),
                ("component_name", Str),
            ],
        ),
        TableSchema::new(
            "040_structural_model_metadata",
            Natural,
            &[("structural_model_name", Str), ("model_type", Str)],
        ),
    ]
}
