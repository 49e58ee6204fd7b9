//! In-memory tabular data
//!
//! A `Dataset` is a set of equally long named columns with an optional key
//! column (the index). Time-indexed data is a `Dataset` whose index is named
//! [`TIME_INDEX`] and holds `Value::Timestamp` cells.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::value::{DataType, Value, from_nanos};

/// Name of the index of every time-indexed dataset
pub const TIME_INDEX: &str = "time";

/// A named column of cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn cast(&mut self, ty: DataType) {
        for value in &mut self.values {
            *value = value.cast(ty);
        }
    }
}

/// Keyed, columnar, in-memory table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    index: Option<Column>,
    columns: Vec<Column>,
}

impl Dataset {
    /// Build a dataset from columns; all columns must share one length.
    ///
    /// # Panics
    ///
    /// Panics when column lengths differ.
    pub fn new(index: Option<Column>, columns: Vec<Column>) -> Self {
        let dataset = Self { index, columns };
        dataset.assert_rectangular();
        dataset
    }

    /// Build a keyed dataset from row-major data
    pub fn from_rows(
        index_name: impl Into<String>,
        column_names: &[&str],
        rows: Vec<(Value, Vec<Value>)>,
    ) -> Self {
        let mut index = Vec::with_capacity(rows.len());
        let mut columns: Vec<Column> = column_names
            .iter()
            .map(|name| Column::new(*name, Vec::with_capacity(rows.len())))
            .collect();
        for (key, cells) in rows {
            assert_eq!(cells.len(), columns.len(), "row width mismatch");
            index.push(key);
            for (column, cell) in columns.iter_mut().zip(cells) {
                column.values.push(cell);
            }
        }
        Self::new(Some(Column::new(index_name, index)), columns)
    }

    fn assert_rectangular(&self) {
        let expected = self.len();
        for column in &self.columns {
            assert_eq!(
                column.len(),
                expected,
                "column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                expected
            );
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.index
            .as_ref()
            .map(Column::len)
            .or_else(|| self.columns.first().map(Column::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self) -> Option<&Column> {
        self.index.as_ref()
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index.as_ref().map(|c| c.name.as_str())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Index column followed by the data columns
    pub fn all_columns_mut(&mut self) -> impl Iterator<Item = &mut Column> {
        self.index.iter_mut().chain(self.columns.iter_mut())
    }

    /// Add or replace a data column
    pub fn insert_column(&mut self, column: Column) {
        if !self.columns.is_empty() || self.index.is_some() {
            assert_eq!(column.len(), self.len(), "column length mismatch");
        }
        match self.column_mut(&column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    /// Cells of row `i` in column order (index excluded)
    pub fn row(&self, i: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[i]).collect()
    }

    /// Promote a data column to be the index; the previous index is
    /// discarded. Returns `false` when the column does not exist.
    pub fn set_index(&mut self, name: &str) -> bool {
        match self.columns.iter().position(|c| c.name == name) {
            Some(pos) => {
                self.index = Some(self.columns.remove(pos));
                true
            }
            None => false,
        }
    }

    /// The key column is always the first column on load
    pub fn set_first_column_as_index(&mut self) {
        if !self.columns.is_empty() {
            self.index = Some(self.columns.remove(0));
        }
    }

    /// Move the index back in front of the data columns
    pub fn reset_index(&mut self) {
        if let Some(index) = self.index.take() {
            self.columns.insert(0, index);
        }
    }

    pub fn drop_index(&mut self) -> Option<Column> {
        self.index.take()
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(pos))
    }

    pub fn retain_columns(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.columns.retain(|c| keep(&c.name));
    }

    /// Keep only the rows where `mask` is true
    pub fn filter_rows(&self, mask: &[bool]) -> Dataset {
        assert_eq!(mask.len(), self.len(), "mask length mismatch");
        let pick = |column: &Column| Column {
            name: column.name.clone(),
            values: column
                .values
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(v, _)| v.clone())
                .collect(),
        };
        Dataset {
            index: self.index.as_ref().map(pick),
            columns: self.columns.iter().map(pick).collect(),
        }
    }

    /// Split the data columns in two by name, both halves keeping the index
    pub fn split_columns(&self, mut left: impl FnMut(&str) -> bool) -> (Dataset, Dataset) {
        let (l, r): (Vec<Column>, Vec<Column>) =
            self.columns.iter().cloned().partition(|c| left(&c.name));
        (
            Dataset {
                index: self.index.clone(),
                columns: l,
            },
            Dataset {
                index: self.index.clone(),
                columns: r,
            },
        )
    }

    /// Left join on the index: every row of `self` is kept, columns of
    /// `other` are appended and filled with `Null` where its index has no
    /// matching key. Columns already present in `self` are not duplicated.
    pub fn join(&self, other: &Dataset) -> Dataset {
        let mut joined = self.clone();
        let (Some(left_index), Some(right_index)) = (&self.index, &other.index) else {
            return joined;
        };
        let positions: HashMap<&Value, usize> = right_index
            .values
            .iter()
            .enumerate()
            .map(|(i, key)| (key, i))
            .collect();
        for column in &other.columns {
            if self.column(&column.name).is_some() {
                continue;
            }
            let values = left_index
                .values
                .iter()
                .map(|key| {
                    positions
                        .get(key)
                        .map_or(Value::Null, |&i| column.values[i].clone())
                })
                .collect();
            joined.columns.push(Column::new(column.name.clone(), values));
        }
        joined
    }

    /// Split rows on whether `identity` is set.
    ///
    /// The first half is keyed by the identity column; the second half has
    /// the identity column removed and no index, ready for an append that
    /// lets the backend assign identities.
    pub fn split_by_identity(&self, identity: &str) -> (Dataset, Dataset) {
        let mut flat = self.clone();
        flat.reset_index();
        let Some(column) = flat.column(identity) else {
            return (Dataset::default(), flat);
        };
        let has_identity: Vec<bool> = column.values.iter().map(|v| !v.is_null()).collect();
        let missing: Vec<bool> = has_identity.iter().map(|b| !b).collect();

        let mut existing = flat.filter_rows(&has_identity);
        existing.set_index(identity);

        let mut fresh = flat.filter_rows(&missing);
        fresh.drop_column(identity);
        (existing, fresh)
    }

    /// Stable sort of all rows by index value
    pub fn sort_by_index(&mut self) {
        let Some(index) = &self.index else { return };
        let mut order: Vec<usize> = (0..index.len()).collect();
        order.sort_by(|&a, &b| compare_values(&index.values[a], &index.values[b]));
        self.reorder(&order);
    }

    pub fn sort_columns(&mut self) {
        self.columns.sort_by(|a, b| a.name.cmp(&b.name));
    }

    fn reorder(&mut self, order: &[usize]) {
        for column in self.all_columns_mut() {
            column.values = order.iter().map(|&i| column.values[i].clone()).collect();
        }
    }

    /// Convert the index to naive timestamps named [`TIME_INDEX`].
    ///
    /// A missing index becomes positional nanoseconds since the epoch,
    /// unparseable keys become `Null`.
    pub fn normalize_time_index(&mut self) {
        let len = self.len();
        let mut index = self.index.take().unwrap_or_else(|| {
            Column::new(TIME_INDEX, (0..len as i64).map(Value::Int).collect())
        });
        index.name = TIME_INDEX.to_string();
        index.cast(DataType::Timestamp);
        self.index = Some(index);
    }

    /// Timestamps of the index, `None` for unparseable keys
    pub fn time_index(&self) -> Vec<Option<NaiveDateTime>> {
        self.index
            .as_ref()
            .map(|index| {
                index
                    .values
                    .iter()
                    .map(|v| v.cast(DataType::Timestamp).as_timestamp())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rows whose timestamp satisfies `start <= t < end`
    pub fn filter_time_range(
        &self,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Dataset {
        let mask: Vec<bool> = self
            .time_index()
            .into_iter()
            .map(|t| in_range(t, start, end))
            .collect();
        self.filter_rows(&mask)
    }
}

/// Half-open range test; an unparseable timestamp only passes when the
/// range is unbounded.
pub fn in_range(
    t: Option<NaiveDateTime>,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
) -> bool {
    match t {
        Some(t) => start.is_none_or(|s| s <= t) && end.is_none_or(|e| t < e),
        None => start.is_none() && end.is_none(),
    }
}

/// Nulls first, then by natural order within a type
fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

/// Positional timestamps used when a dataset has no index
pub fn positional_time(i: usize) -> NaiveDateTime {
    from_nanos(i as i64)
}
