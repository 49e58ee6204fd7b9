//! Static domain entities: services, time-series metadata, instances,
//! sensors and structural models

use std::collections::BTreeMap;

use crate::storage::{Dataset, StorageError, StorageResult};

/// A registered service; carries no attributes besides its name (the map
/// key)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceMetadata;

/// Link from a time series or sensor to one structural model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuralModelInfo {
    /// Record identity; `None` until persisted
    pub id: Option<i64>,
    pub component_name: Option<String>,
    /// Connection table, stored as its own file
    pub connection: Option<Dataset>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorInfo {
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sensor {
    pub locational: bool,
    pub directional: bool,
    /// Keyed by structural model name
    pub structural_model_info: BTreeMap<String, StructuralModelInfo>,
    /// Sensor layout table
    pub data: Option<Dataset>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesMetadata {
    pub coord_sys: Option<String>,
    /// Keyed by sensor name
    pub sensor_info: BTreeMap<String, SensorInfo>,
    /// Keyed by structural model name
    pub structural_model_info: BTreeMap<String, StructuralModelInfo>,
}

/// One input or output of an instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceIoMetadata {
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceMetadata {
    pub model_name: String,
    pub service_name: String,
    /// Keyed by data name
    pub input_metadata: BTreeMap<String, InstanceIoMetadata>,
    pub output_metadata: BTreeMap<String, InstanceIoMetadata>,
}

/// Structural model variants, each with a fixed set of component tables
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralModel {
    PointCloud {
        point_cloud: Option<Dataset>,
    },
    FiniteElement {
        fe_node: Option<Dataset>,
        fe_elem: Option<Dataset>,
        fe_connection: Option<Dataset>,
        fe_constraint: Option<Dataset>,
    },
    Graph {
        graph_node: Option<Dataset>,
        graph_edge: Option<Dataset>,
    },
}

const POINT_CLOUD_COMPONENTS: &[&str] = &["point_cloud"];
const FINITE_ELEMENT_COMPONENTS: &[&str] = &["fe_node", "fe_elem", "fe_connection", "fe_constraint"];
const GRAPH_COMPONENTS: &[&str] = &["graph_node", "graph_edge"];

impl StructuralModel {
    /// Stored type string of the variant
    pub fn model_type(&self) -> &'static str {
        match self {
            StructuralModel::PointCloud { .. } => "point_cloud",
            StructuralModel::FiniteElement { .. } => "fe",
            StructuralModel::Graph { .. } => "graph",
        }
    }

    /// Component table names for a stored type string
    pub fn component_names_of(model_type: &str) -> Option<&'static [&'static str]> {
        match model_type {
            "point_cloud" => Some(POINT_CLOUD_COMPONENTS),
            "fe" => Some(FINITE_ELEMENT_COMPONENTS),
            "graph" => Some(GRAPH_COMPONENTS),
            _ => None,
        }
    }

    pub fn component_names(&self) -> &'static [&'static str] {
        match self {
            StructuralModel::PointCloud { .. } => POINT_CLOUD_COMPONENTS,
            StructuralModel::FiniteElement { .. } => FINITE_ELEMENT_COMPONENTS,
            StructuralModel::Graph { .. } => GRAPH_COMPONENTS,
        }
    }

    /// `(component name, table)` pairs in declaration order
    pub fn components(&self) -> Vec<(&'static str, Option<&Dataset>)> {
        match self {
            StructuralModel::PointCloud { point_cloud } => vec![("point_cloud", point_cloud.as_ref())],
            StructuralModel::FiniteElement {
                fe_node,
                fe_elem,
                fe_connection,
                fe_constraint,
            } => vec![
                ("fe_node", fe_node.as_ref()),
                ("fe_elem", fe_elem.as_ref()),
                ("fe_connection", fe_connection.as_ref()),
                ("fe_constraint", fe_constraint.as_ref()),
            ],
            StructuralModel::Graph {
                graph_node,
                graph_edge,
            } => vec![
                ("graph_node", graph_node.as_ref()),
                ("graph_edge", graph_edge.as_ref()),
            ],
        }
    }

    /// Build the variant named by `model_type`; components missing from
    /// the map are `None`
    pub fn from_components(
        model_type: &str,
        mut components: BTreeMap<String, Option<Dataset>>,
    ) -> StorageResult<Self> {
        let mut take = |name: &str| components.remove(name).flatten();
        match model_type {
            "point_cloud" => Ok(StructuralModel::PointCloud {
                point_cloud: take("point_cloud"),
            }),
            "fe" => Ok(StructuralModel::FiniteElement {
                fe_node: take("fe_node"),
                fe_elem: take("fe_elem"),
                fe_connection: take("fe_connection"),
                fe_constraint: take("fe_constraint"),
            }),
            "graph" => Ok(StructuralModel::Graph {
                graph_node: take("graph_node"),
                graph_edge: take("graph_edge"),
            }),
            other => Err(StorageError::InvalidConfig(format!(
                "unknown structural model type '{}'",
                other
            ))),
        }
    }
}

/// Aggregate of all static entities, each map keyed by entity name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticData {
    pub service_metadata: BTreeMap<String, ServiceMetadata>,
    pub time_series_metadata: BTreeMap<String, TimeSeriesMetadata>,
    pub instance_metadata: BTreeMap<String, InstanceMetadata>,
    pub sensors: BTreeMap<String, Sensor>,
    pub structural_models: BTreeMap<String, StructuralModel>,
}

impl StaticData {
    /// Merge by key; entries of `other` win on collision
    pub fn update(&mut self, other: StaticData) {
        self.service_metadata.extend(other.service_metadata);
        self.time_series_metadata.extend(other.time_series_metadata);
        self.instance_metadata.extend(other.instance_metadata);
        self.sensors.extend(other.sensors);
        self.structural_models.extend(other.structural_models);
    }
}
