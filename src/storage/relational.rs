//! Relational storage backend
//!
//! Talks to Postgres or SQLite through the sqlx `Any` driver; the dialect is
//! picked from the URL scheme. Tables are addressed by their plain name and
//! every identifier is double-quoted.
//!
//! ## Sync
//!
//! `SaveMode::Sync` upserts a keyed dataset in four statements:
//!
//! 1. create a staging table `<table>_<fingerprint>` shaped like the target
//! 2. bulk-insert the dataset into it
//! 3. `INSERT INTO target SELECT ... FROM staging ON CONFLICT (key) DO UPDATE`
//! 4. drop the staging table
//!
//! Only step 3 touches the target. A crash before step 4 leaves an inert
//! staging table behind; it is named after the content fingerprint, so the
//! next sync of the same data replaces it.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column as _, Row, TypeInfo, ValueRef};
use tracing::{debug, info, instrument, warn};

use super::backend::{BackendKind, SaveMode, StorageBackend};
use super::dataset::{Column, Dataset};
use super::error::{StorageError, StorageResult};
use super::schema::{KeyKind, SchemaRegistry, TableSchema};
use super::value::{DataType, Value, format_timestamp};

/// Bind parameters per statement, below SQLite's historical limit of 999
const MAX_PARAMS: usize = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl FromStr for Dialect {
    type Err = StorageError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(StorageError::InvalidConfig(format!(
                "unsupported relational database URL: {}",
                redact(url)
            )))
        }
    }
}

impl Dialect {
    fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// SQLite booleans are declared INTEGER; the `Any` driver cannot read a
    /// column declared BOOLEAN there
    fn column_type(&self, ty: DataType) -> &'static str {
        match (self, ty) {
            (_, DataType::Int) => "BIGINT",
            (_, DataType::Float) => "DOUBLE PRECISION",
            (Dialect::Postgres, DataType::Bool) => "BOOLEAN",
            (Dialect::Sqlite, DataType::Bool) => "INTEGER",
            (_, DataType::Str | DataType::Timestamp) => "TEXT",
        }
    }

    fn identity_column(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }
}

/// Strip the password from a URL before it ends up in a log or error
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            let credentials = &url[scheme + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn is_missing_relation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("42P01") || db.message().contains("no such table")
        }
        _ => false,
    }
}

/// Column written by an insert, with the type used for its DDL
struct InsertColumn<'a> {
    name: &'a str,
    ty: DataType,
    values: &'a [Value],
}

/// Index (if any) first, then the data columns.
///
/// A column declared in `schema` uses its declared type; any other column
/// takes the type of its first non-null cell, or text when all are null.
fn insert_columns<'a>(dataset: &'a Dataset, schema: Option<&TableSchema>) -> Vec<InsertColumn<'a>> {
    dataset
        .index()
        .into_iter()
        .chain(dataset.columns())
        .map(|column: &Column| InsertColumn {
            name: &column.name,
            ty: schema
                .and_then(|s| s.type_of(&column.name))
                .or_else(|| column.values.iter().find_map(Value::data_type))
                .unwrap_or(DataType::Str),
            values: &column.values,
        })
        .collect()
}

/// Nulls are bound with the column's type so Postgres accepts them
fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &Value,
    ty: DataType,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => match ty {
            DataType::Int => query.bind(None::<i64>),
            DataType::Float => query.bind(None::<f64>),
            DataType::Bool => query.bind(None::<bool>),
            DataType::Str | DataType::Timestamp => query.bind(None::<String>),
        },
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Bool(v) => query.bind(*v),
        Value::Str(v) => query.bind(v.clone()),
        Value::Timestamp(t) => query.bind(format_timestamp(t)),
    }
}

fn decode_cell(row: &AnyRow, i: usize) -> StorageResult<Value> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(i)?),
        "SMALLINT" => Value::Int(i64::from(row.try_get::<i16, _>(i)?)),
        "INTEGER" => Value::Int(i64::from(row.try_get::<i32, _>(i)?)),
        "BIGINT" => Value::Int(row.try_get::<i64, _>(i)?),
        "REAL" => Value::Float(f64::from(row.try_get::<f32, _>(i)?)),
        "DOUBLE" => Value::Float(row.try_get::<f64, _>(i)?),
        "TEXT" => Value::Str(row.try_get::<String, _>(i)?),
        "BLOB" => Value::Str(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(i)?).into_owned()),
        other => {
            warn!("unsupported column type {other}, reading as null");
            Value::Null
        }
    };
    Ok(value)
}

/// Name of the staging table for one sync of `dataset` into `table`
pub fn staging_table_name(table: &str, dataset: &Dataset) -> StorageResult<String> {
    let payload =
        bincode::serialize(dataset).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let mut h = blake3::Hasher::new();
    h.update(table.as_bytes());
    h.update(b"\0");
    h.update(&payload);
    let hex = h.finalize().to_hex();
    Ok(format!("{}_{}", table, &hex[..16]))
}

/// Postgres / SQLite backend
pub struct RelationalBackend {
    pool: AnyPool,
    dialect: Dialect,
    schemas: SchemaRegistry,
}

impl RelationalBackend {
    /// Connect to `url` (`postgres://...` or `sqlite://...`)
    #[instrument(skip_all)]
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let dialect: Dialect = url.parse()?;
        info!("connecting to {:?} database at {}", dialect, redact(url));

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        info!("relational connection pool created");
        Ok(Self {
            pool,
            dialect,
            schemas: SchemaRegistry::builtin(),
        })
    }

    /// Declarations used for the column types of inserts and created tables
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn create_table_ddl(&self, schema: &TableSchema) -> String {
        let definitions: Vec<String> = schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| match (i, schema.key) {
                (0, KeyKind::Synthetic) => {
                    format!("{} {}", quote(name), self.dialect.identity_column())
                }
                (0, KeyKind::Natural) => {
                    format!("{} {} PRIMARY KEY", quote(name), self.dialect.column_type(*ty))
                }
                _ => format!("{} {}", quote(name), self.dialect.column_type(*ty)),
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&schema.name),
            definitions.join(", ")
        )
    }

    /// `CREATE TABLE IF NOT EXISTS` with column types inferred from the data;
    /// the index, when present, becomes the primary key
    async fn ensure_table(&self, table: &str, dataset: &Dataset) -> StorageResult<()> {
        let has_key = dataset.index().is_some();
        let definitions: Vec<String> = insert_columns(dataset, self.schemas.get(table))
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let mut definition =
                    format!("{} {}", quote(column.name), self.dialect.column_type(column.ty));
                if i == 0 && has_key {
                    definition.push_str(" PRIMARY KEY");
                }
                definition
            })
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(table),
            definitions.join(", ")
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert all rows of `dataset` into `table` in one transaction, chunked
    /// to stay below the driver's parameter limit. Null binds are typed
    /// after `schema`.
    #[instrument(skip(self, dataset, schema), fields(rows = dataset.len()))]
    async fn bulk_insert(
        &self,
        table: &str,
        dataset: &Dataset,
        schema: Option<&TableSchema>,
    ) -> StorageResult<()> {
        let columns = insert_columns(dataset, schema);
        if columns.is_empty() {
            return Ok(());
        }
        let column_list: Vec<String> = columns.iter().map(|c| quote(c.name)).collect();
        let rows_per_chunk = (MAX_PARAMS / columns.len()).max(1);

        let mut tx = self.pool.begin().await?;
        let mut start = 0;
        while start < dataset.len() {
            let end = (start + rows_per_chunk).min(dataset.len());

            let mut n = 0;
            let tuples: Vec<String> = (start..end)
                .map(|_| {
                    let placeholders: Vec<String> = columns
                        .iter()
                        .map(|_| {
                            n += 1;
                            self.dialect.placeholder(n)
                        })
                        .collect();
                    format!("({})", placeholders.join(", "))
                })
                .collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote(table),
                column_list.join(", "),
                tuples.join(", ")
            );

            let mut query = sqlx::query(&sql);
            for row in start..end {
                for column in &columns {
                    query = bind_value(query, &column.values[row], column.ty);
                }
            }
            query.execute(&mut *tx).await?;
            start = end;
        }
        tx.commit().await?;
        debug!("inserted {} rows into {}", dataset.len(), table);
        Ok(())
    }

    async fn append(&self, table: &str, dataset: &Dataset) -> StorageResult<()> {
        self.ensure_table(table, dataset).await?;
        self.bulk_insert(table, dataset, self.schemas.get(table)).await
    }

    #[instrument(skip(self, dataset), fields(rows = dataset.len()))]
    async fn sync(&self, table: &str, dataset: &Dataset) -> StorageResult<()> {
        let Some(key) = dataset.index_name() else {
            return Err(StorageError::InvalidMode {
                backend: BackendKind::Relational,
                mode: format!("{} without a key column", SaveMode::Sync),
            });
        };

        let staging = staging_table_name(table, dataset)?;
        debug!("syncing {} through {}", table, staging);

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&staging)))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {} AS SELECT * FROM {} WHERE 1 = 0",
            quote(&staging),
            quote(table)
        ))
        .execute(&self.pool)
        .await?;

        let upsert = async {
            self.bulk_insert(&staging, dataset, self.schemas.get(table))
                .await?;

            let columns: Vec<String> = insert_columns(dataset, None)
                .iter()
                .map(|c| quote(c.name))
                .collect();
            let updates: Vec<String> = dataset
                .column_names()
                .iter()
                .map(|name| format!("{0} = excluded.{0}", quote(name)))
                .collect();
            let on_conflict = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            // `WHERE true` keeps SQLite from parsing ON CONFLICT as a join clause
            let sql = format!(
                "INSERT INTO {table} ({cols}) SELECT {cols} FROM {staging} WHERE true ON CONFLICT ({key}) {on_conflict}",
                table = quote(table),
                cols = columns.join(", "),
                staging = quote(&staging),
                key = quote(key),
            );
            let result = sqlx::query(&sql).execute(&self.pool).await?;
            debug!("upserted {} rows into {}", result.rows_affected(), table);
            Ok::<_, StorageError>(())
        }
        .await;

        let cleanup = sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&staging)))
            .execute(&self.pool)
            .await;

        upsert?;
        cleanup.map_err(|e| StorageError::StagingCleanupFailed {
            table: staging,
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    #[instrument(skip(self))]
    async fn load_table(&self, id: &str) -> StorageResult<Option<Dataset>> {
        debug!("load table data from relational database: {}", id);
        let sql = format!("SELECT * FROM {}", quote(id));
        let rows = match sqlx::query(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(e) if is_missing_relation(&e) => {
                info!("table not found: {}", id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // An empty result carries no column metadata
        let Some(first) = rows.first() else {
            return Ok(Some(Dataset::default()));
        };
        let mut columns: Vec<Column> = first
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), Vec::with_capacity(rows.len())))
            .collect();
        for row in &rows {
            for (i, column) in columns.iter_mut().enumerate() {
                column.values.push(decode_cell(row, i)?);
            }
        }
        Ok(Some(Dataset::new(None, columns)))
    }

    #[instrument(skip(self, dataset), fields(rows = dataset.len()))]
    async fn save_table(&self, id: &str, dataset: &Dataset, mode: SaveMode) -> StorageResult<()> {
        if dataset.is_empty() {
            return Ok(());
        }
        debug!("save table data to relational database: {} ({})", id, mode);
        match mode {
            SaveMode::Append => self.append(id, dataset).await,
            SaveMode::Sync => self.sync(id, dataset).await,
            SaveMode::Replace => Err(StorageError::InvalidMode {
                backend: self.kind(),
                mode: mode.to_string(),
            }),
        }
    }

    #[instrument(skip_all)]
    async fn create_tables(&self, schemas: &SchemaRegistry) -> StorageResult<()> {
        for schema in schemas.tables() {
            debug!("create table {}", schema.name);
            sqlx::query(&self.create_table_ddl(schema))
                .execute(&self.pool)
                .await?;
        }
        info!("created {} tables", schemas.tables().len());
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing relational connection pool");
        self.pool.close().await;
        Ok(())
    }
}
