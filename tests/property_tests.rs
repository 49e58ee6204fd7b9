//! Property-based tests for invariants using proptest
//!
//! These tests verify that certain properties hold true for all inputs:
//! - Coercion only ever keeps declared columns and never invents rows
//! - Unknown tables pass through coercion unchanged
//! - Time-range filtering keeps exactly the rows inside `[start, end)`
//! - Identity splitting partitions rows without losing any
//! - A declared table saved to CSV or SQLite loads back as its coerced self

use proptest::prelude::*;
use structural_datastore::storage::{
    BackendKind, Column, DataType, Dataset, KeyKind, SaveMode, SchemaRegistry, StorageHandler,
    TIME_INDEX, TableSchema, Value, file::FileBackend, relational::RelationalBackend,
    value::from_nanos,
};

fn cell() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        "[a-z0-9 .-]{0,8}".prop_map(Value::Str),
    ]
}

fn sensor_rows() -> impl Strategy<Value = Vec<(Value, Value, Value)>> {
    prop::collection::vec((cell(), cell(), cell()), 0..30)
}

fn sensor_table(rows: &[(Value, Value, Value)]) -> Dataset {
    Dataset::new(
        None,
        vec![
            Column::new("sensor_name", rows.iter().map(|r| r.0.clone()).collect()),
            Column::new("locational", rows.iter().map(|r| r.1.clone()).collect()),
            Column::new("stray", rows.iter().map(|r| r.2.clone()).collect()),
        ],
    )
}

// Property: coercion drops undeclared columns and keeps the row count
proptest! {
    #[test]
    fn prop_coerce_keeps_rows_and_declared_columns(rows in sensor_rows()) {
        let registry = SchemaRegistry::builtin();
        let coerced = registry.coerce("030_sensor_metadata", sensor_table(&rows));

        prop_assert_eq!(coerced.len(), rows.len());
        prop_assert_eq!(coerced.column_names(), vec!["sensor_name", "locational"]);
        for value in &coerced.column("locational").unwrap().values {
            prop_assert!(matches!(value, Value::Null | Value::Bool(_)));
        }
    }
}

// Property: coercing twice is the same as coercing once
proptest! {
    #[test]
    fn prop_coerce_is_idempotent(rows in sensor_rows()) {
        let registry = SchemaRegistry::builtin();
        let once = registry.coerce("030_sensor_metadata", sensor_table(&rows));
        let twice = registry.coerce("030_sensor_metadata", once.clone());
        prop_assert_eq!(once, twice);
    }
}

// Property: tables without a declaration pass through untouched
proptest! {
    #[test]
    fn prop_unknown_table_passes_through(rows in sensor_rows()) {
        let table = sensor_table(&rows);
        let coerced = SchemaRegistry::builtin().coerce("static_data/031_sensors/rosette", table.clone());
        prop_assert_eq!(coerced, table);
    }
}

// Property: a bounded time filter keeps exactly the rows with start <= t < end
proptest! {
    #[test]
    fn prop_time_range_is_half_open(
        n in 0usize..50,
        start in proptest::option::of(-5i64..60),
        end in proptest::option::of(-5i64..60),
    ) {
        let rows = (0..n)
            .map(|i| (Value::Timestamp(from_nanos(i as i64)), vec![Value::Int(i as i64)]))
            .collect();
        let series = Dataset::from_rows(TIME_INDEX, &["x"], rows);

        let filtered = series.filter_time_range(start.map(from_nanos), end.map(from_nanos));
        let expected: Vec<Value> = (0..n as i64)
            .filter(|i| start.is_none_or(|s| s <= *i) && end.is_none_or(|e| *i < e))
            .map(Value::Int)
            .collect();
        prop_assert_eq!(&filtered.column("x").unwrap().values, &expected);
    }
}

// Property: identity splitting never loses or duplicates a row
proptest! {
    #[test]
    fn prop_identity_split_partitions_rows(ids in prop::collection::vec(proptest::option::of(1i64..1000), 0..40)) {
        let names: Vec<Value> = (0..ids.len()).map(|i| Value::from(format!("row-{i}"))).collect();
        let dataset = Dataset::new(
            None,
            vec![
                Column::new("id", ids.iter().map(|id| Value::from(*id)).collect()),
                Column::new("name", names),
            ],
        );

        let (existing, fresh) = dataset.split_by_identity("id");
        prop_assert_eq!(existing.len() + fresh.len(), ids.len());
        prop_assert_eq!(existing.len(), ids.iter().filter(|id| id.is_some()).count());
        prop_assert!(fresh.column("id").is_none());
        prop_assert!(existing.index().unwrap().values.iter().all(|v| !v.is_null()));
    }
}

const READINGS: &str = "900_readings";

/// A registry with one table covering every declared type
fn readings_registry() -> SchemaRegistry {
    SchemaRegistry::empty().with_table(TableSchema::new(
        READINGS,
        KeyKind::Natural,
        &[
            ("label", DataType::Str),
            ("count", DataType::Int),
            ("ratio", DataType::Float),
            ("active", DataType::Bool),
            ("seen", DataType::Timestamp),
        ],
    ))
}

/// Text that is easy to confuse with null or with another type
fn tricky_text() -> impl Strategy<Value = String> {
    prop_oneof![
        "[^\\x00]{0,12}",
        "\"{0,3}",
        Just("true".to_string()),
        Just("False".to_string()),
        Just("1.50".to_string()),
        Just(" 7 ".to_string()),
        Just("2020-04-25 00:00:01".to_string()),
    ]
}

fn any_cell() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        tricky_text().prop_map(Value::Str),
        any::<i64>().prop_map(|ns| Value::Timestamp(from_nanos(ns))),
    ]
}

fn readings(rows: &[[Value; 5]]) -> Dataset {
    let names = ["label", "count", "ratio", "active", "seen"];
    Dataset::new(
        None,
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Column::new(*name, rows.iter().map(|r| r[i].clone()).collect()))
            .collect(),
    )
}

/// What a load of `dataset` must return: its coerced form keyed by label
fn expected_load(registry: &SchemaRegistry, dataset: Dataset) -> Dataset {
    let mut expected = registry.coerce(READINGS, dataset);
    expected.set_first_column_as_index();
    expected
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

// Property: CSV keeps every coerced cell, empty strings and look-alikes included
proptest! {
    #[test]
    fn prop_file_table_round_trip(
        rows in prop::collection::vec(
            [any_cell(), any_cell(), any_cell(), any_cell(), any_cell()],
            1..20,
        )
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = readings_registry();
        let handler = StorageHandler::new(dir.path(), registry.clone()).with_backend(Box::new(
            FileBackend::new(dir.path()).with_schemas(registry.clone()),
        ));
        let dataset = readings(&rows);

        let loaded = runtime().block_on(async {
            handler
                .save_table(BackendKind::File, READINGS, &dataset, SaveMode::Replace)
                .await
                .unwrap();
            handler.load_table(BackendKind::File, READINGS).await.unwrap()
        });

        prop_assert_eq!(loaded, Some(expected_load(&registry, dataset)));
    }
}

fn sqlite_row() -> impl Strategy<Value = [Value; 4]> {
    (
        proptest::option::of(any::<i64>()),
        proptest::option::of(-1e9f64..1e9),
        proptest::option::of(any::<bool>()),
        proptest::option::of(any::<i64>().prop_map(from_nanos)),
    )
        .prop_map(|(count, ratio, active, seen)| {
            [count.into(), ratio.into(), active.into(), seen.into()]
        })
}

// Property: SQLite returns what was appended, nulls typed by the declaration
proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_sqlite_table_round_trip(
        cells in prop::collection::vec(sqlite_row(), 1..20),
        labels in prop::collection::vec(tricky_text(), 20),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = readings_registry();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("store.db").display());

        // Natural keys must be unique
        let rows: Vec<[Value; 5]> = cells
            .iter()
            .enumerate()
            .map(|(i, [count, ratio, active, seen])| {
                [
                    Value::Str(format!("{i:02}-{}", labels[i])),
                    count.clone(),
                    ratio.clone(),
                    active.clone(),
                    seen.clone(),
                ]
            })
            .collect();
        let dataset = readings(&rows);

        let loaded = runtime().block_on(async {
            let relational = RelationalBackend::connect(&url)
                .await
                .unwrap()
                .with_schemas(registry.clone());
            let handler = StorageHandler::new(dir.path(), registry.clone())
                .with_backend(Box::new(relational));
            handler.create_tables().await.unwrap();
            handler
                .save_table(BackendKind::Relational, READINGS, &dataset, SaveMode::Append)
                .await
                .unwrap();
            let loaded = handler.load_table(BackendKind::Relational, READINGS).await.unwrap();
            handler.close().await.unwrap();
            loaded
        });

        let mut loaded = loaded.unwrap();
        loaded.sort_by_index();
        let mut expected = expected_load(&registry, dataset);
        expected.sort_by_index();
        prop_assert_eq!(loaded, expected);
    }
}
