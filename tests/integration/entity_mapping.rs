//! Entity graph round trips through the data manager

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use structural_datastore::entities::{
    InstanceIoMetadata, InstanceMetadata, Sensor, SensorInfo, ServiceMetadata, StaticData,
    StructuralModel, StructuralModelInfo, TimeSeriesMetadata,
};
use structural_datastore::storage::{BackendKind, Dataset, Value};

use crate::helpers::{local_handler, manager, points, sqlite_handler};

fn elements() -> Dataset {
    Dataset::from_rows(
        "elem_id",
        &["node_a", "node_b"],
        vec![
            (Value::Int(0), vec![Value::Int(0), Value::Int(1)]),
            (Value::Int(1), vec![Value::Int(1), Value::Int(2)]),
        ],
    )
}

fn graph() -> StaticData {
    let mut data = StaticData::default();
    data.service_metadata
        .insert("monitoring".into(), ServiceMetadata);
    data.service_metadata.insert("anomaly".into(), ServiceMetadata);

    data.structural_models.insert(
        "bridge".into(),
        StructuralModel::FiniteElement {
            fe_node: Some(points(3)),
            fe_elem: Some(elements()),
            fe_connection: None,
            fe_constraint: None,
        },
    );
    data.structural_models.insert(
        "deck".into(),
        StructuralModel::PointCloud {
            point_cloud: Some(points(18)),
        },
    );

    let on_bridge = |id| StructuralModelInfo {
        id: Some(id),
        component_name: Some("fe_node".into()),
        connection: Some(points(2)),
    };
    data.sensors.insert(
        "rosette".into(),
        Sensor {
            locational: true,
            directional: true,
            structural_model_info: BTreeMap::from([("bridge".to_string(), on_bridge(1))]),
            data: Some(points(1)),
        },
    );
    data.sensors.insert(
        "gauge".into(),
        Sensor {
            locational: false,
            directional: true,
            structural_model_info: BTreeMap::new(),
            data: None,
        },
    );

    data.time_series_metadata.insert(
        "acc".into(),
        TimeSeriesMetadata {
            coord_sys: Some("global".into()),
            sensor_info: BTreeMap::from([
                ("rosette".to_string(), SensorInfo { id: Some(1) }),
                ("gauge".to_string(), SensorInfo { id: Some(2) }),
            ]),
            structural_model_info: BTreeMap::from([("bridge".to_string(), on_bridge(1))]),
        },
    );

    data.instance_metadata.insert(
        "detector".into(),
        InstanceMetadata {
            model_name: "isolation_forest".into(),
            service_name: "anomaly".into(),
            input_metadata: BTreeMap::from([("acc".to_string(), InstanceIoMetadata { id: Some(1) })]),
            output_metadata: BTreeMap::from([(
                "acc_score".to_string(),
                InstanceIoMetadata { id: Some(1) },
            )]),
        },
    );
    data
}

#[tokio::test]
async fn test_graph_round_trip_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(local_handler(dir.path()));

    manager
        .export_static_data(&graph(), BackendKind::File)
        .await
        .unwrap();
    let imported = manager.import_static_data(BackendKind::File).await.unwrap();

    assert_eq!(imported, graph());
}

#[tokio::test]
async fn test_file_export_seeds_relational_store() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(sqlite_handler(dir.path()).await);

    // metadata tables land in static_data/init_rdb, the seed location
    manager
        .export_static_data(&graph(), BackendKind::File)
        .await
        .unwrap();
    manager.init_rdb().await.unwrap();

    let imported = manager
        .import_static_data(BackendKind::Relational)
        .await
        .unwrap();
    assert_eq!(imported, graph());
}

#[tokio::test]
async fn test_relational_export_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(sqlite_handler(dir.path()).await);

    for _ in 0..2 {
        manager
            .export_static_data(&graph(), BackendKind::Relational)
            .await
            .unwrap();
    }
    let imported = manager
        .import_static_data(BackendKind::Relational)
        .await
        .unwrap();

    assert_eq!(imported, graph());
}

#[tokio::test]
async fn test_update_then_export_merges() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(local_handler(dir.path()));
    manager
        .export_static_data(&graph(), BackendKind::File)
        .await
        .unwrap();

    let mut data = manager.import_static_data(BackendKind::File).await.unwrap();
    let mut patch = StaticData::default();
    patch.sensors.insert(
        "gauge".into(),
        Sensor {
            locational: true,
            ..Sensor::default()
        },
    );
    data.update(patch);
    manager
        .export_static_data(&data, BackendKind::File)
        .await
        .unwrap();

    let reloaded = manager.import_static_data(BackendKind::File).await.unwrap();
    assert!(reloaded.sensors["gauge"].locational);
    assert_eq!(reloaded.sensors["rosette"], graph().sensors["rosette"]);
    assert_eq!(reloaded.structural_models, graph().structural_models);
}
