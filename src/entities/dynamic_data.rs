//! Dynamic domain entities: measurement series and batch bookkeeping

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::storage::{Dataset, StorageResult, split_tags};

/// Column name prefixes that mark a time-series column as a tag
pub const TAG_KEYS: [&str; 3] = ["batch_id", "service_name", "batch_datetime"];

pub fn tag_keys() -> Vec<String> {
    TAG_KEYS.iter().map(|k| k.to_string()).collect()
}

/// One named measurement series, split into numeric fields and tags.
/// Both halves share the time index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesData {
    pub fields: Dataset,
    pub tags: Option<Dataset>,
}

impl TimeSeriesData {
    pub fn new(fields: Dataset, tags: Option<Dataset>) -> Self {
        Self { fields, tags }
    }

    /// Split a combined dataset by [`TAG_KEYS`]
    pub fn from_combined(dataset: &Dataset) -> StorageResult<Self> {
        let (fields, tags) = split_tags(dataset, &tag_keys())?;
        Ok(Self {
            fields,
            tags: Some(tags),
        })
    }

    /// Fields joined with the tags on the time index
    pub fn combined(&self) -> Dataset {
        match &self.tags {
            Some(tags) => self.fields.join(tags),
            None => self.fields.clone(),
        }
    }
}

/// Edge to a batch this batch depends on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchDependency {
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesBatchMetadata {
    pub service_name: String,
    pub batch_datetime: Option<NaiveDateTime>,
    /// Keyed by the id of the batch depended upon
    pub dependencies: BTreeMap<i64, BatchDependency>,
}

/// Aggregate of all dynamic entities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicData {
    /// Keyed by data name
    pub time_series_data: BTreeMap<String, TimeSeriesData>,
    /// Keyed by batch id
    pub time_series_batch_metadata: BTreeMap<i64, TimeSeriesBatchMetadata>,
}

impl DynamicData {
    /// Merge by key; entries of `other` win on collision
    pub fn update(&mut self, other: DynamicData) {
        self.time_series_data.extend(other.time_series_data);
        self.time_series_batch_metadata
            .extend(other.time_series_batch_metadata);
    }
}
