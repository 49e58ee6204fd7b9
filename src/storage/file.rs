//! Flat-file storage backend
//!
//! One CSV file per table or series at `<datadrive>/<id>.csv`, where `id`
//! is a category path such as `static_data/init_rdb/030_sensor_metadata`.
//! The first column is always the key (tables) or the time index (series).
//!
//! ## Cells
//!
//! - `Value::Null` is the empty cell.
//! - A string made only of double quotes, the empty string included, is
//!   written with one extra quote, so `""` and null stay apart.
//! - Columns declared in the schema registry are read back as raw text and
//!   typed by schema coercion; every other cell goes through
//!   `Value::infer`.
//!
//! All file access runs on the blocking thread pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::backend::{BackendKind, SaveMode, StorageBackend, TimeRange};
use super::dataset::{Column, Dataset, TIME_INDEX};
use super::error::{StorageError, StorageResult};
use super::schema::{SchemaRegistry, TableSchema};
use super::value::{Value, parse_timestamp};

const EXTENSION: &str = "csv";

/// Text of one cell
fn encode_cell(value: &Value) -> String {
    match value {
        Value::Str(s) if s.bytes().all(|b| b == b'"') => format!("{s}\""),
        other => other.to_string(),
    }
}

/// Inverse of [`encode_cell`]; `raw` keeps the text untyped
fn decode_cell(text: &str, raw: bool) -> Value {
    if text.is_empty() {
        Value::Null
    } else if text.bytes().all(|b| b == b'"') {
        Value::Str(text[1..].to_string())
    } else if raw {
        Value::Str(text.to_string())
    } else {
        Value::infer(text)
    }
}

fn reader(path: &Path) -> StorageResult<csv::Reader<File>> {
    // A concurrent append can leave a short last record
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?)
}

fn empty_columns(reader: &mut csv::Reader<File>) -> StorageResult<Vec<Column>> {
    Ok(reader
        .headers()?
        .iter()
        .map(|name| Column::new(name, Vec::new()))
        .collect())
}

/// Run blocking file I/O off the async workers
async fn blocking<T, F>(task: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StorageError::IoError(io::Error::other(e)))?
}

/// CSV file backend
pub struct FileBackend {
    root: PathBuf,
    schemas: SchemaRegistry,
}

impl FileBackend {
    /// Backend rooted at `root`, reading the built-in tables as raw text
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            schemas: SchemaRegistry::builtin(),
        }
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<id>.csv`; an id that already names a `.csv` file is used as is
    pub fn path_for(&self, id: &str) -> PathBuf {
        let relative = Path::new(id);
        if relative.extension().is_some_and(|ext| ext == EXTENSION) {
            self.root.join(relative)
        } else {
            self.root.join(format!("{id}.{EXTENSION}"))
        }
    }

    fn read_table(path: &Path, schema: Option<&TableSchema>) -> StorageResult<Dataset> {
        let mut reader = reader(path)?;
        let mut columns = empty_columns(&mut reader)?;
        let raw: Vec<bool> = columns
            .iter()
            .map(|c| schema.is_some_and(|s| s.type_of(&c.name).is_some()))
            .collect();

        let mut record = csv::StringRecord::new();
        while reader.read_record(&mut record)? {
            for (i, column) in columns.iter_mut().enumerate() {
                column
                    .values
                    .push(decode_cell(record.get(i).unwrap_or(""), raw[i]));
            }
        }
        Ok(Dataset::new(None, columns))
    }

    /// Read a series in one pass, skipping rows outside `range`.
    ///
    /// Only the first cell of a skipped row is parsed. Rows appended while
    /// the read is in progress are included if the reader gets to them.
    fn read_series(path: &Path, range: TimeRange) -> StorageResult<Dataset> {
        let mut reader = reader(path)?;
        let mut columns = empty_columns(&mut reader)?;

        let mut record = csv::StringRecord::new();
        while reader.read_record(&mut record)? {
            let t = record.get(0).and_then(parse_timestamp);
            if !range.is_unbounded() && !range.contains(t) {
                continue;
            }
            for (i, column) in columns.iter_mut().enumerate() {
                let value = if i == 0 {
                    t.map_or(Value::Null, Value::Timestamp)
                } else {
                    decode_cell(record.get(i).unwrap_or(""), false)
                };
                column.values.push(value);
            }
        }

        let mut dataset = Dataset::new(None, columns);
        dataset.set_first_column_as_index();
        if dataset.index().is_none() {
            dataset = Dataset::new(Some(Column::new(TIME_INDEX, Vec::new())), Vec::new());
        }
        dataset.normalize_time_index();
        Ok(dataset)
    }

    fn header_and_rows(dataset: &Dataset) -> (Vec<String>, Vec<Vec<String>>) {
        let index = dataset.index();
        let mut header = Vec::with_capacity(dataset.columns().len() + 1);
        if let Some(index) = index {
            header.push(index.name.clone());
        }
        header.extend(dataset.column_names().iter().map(|n| n.to_string()));

        let rows = (0..dataset.len())
            .map(|i| {
                index
                    .map(|c| &c.values[i])
                    .into_iter()
                    .chain(dataset.row(i))
                    .map(encode_cell)
                    .collect()
            })
            .collect();
        (header, rows)
    }

    /// Overwrite `path` through a temporary sibling so readers never see a
    /// partially written file
    fn write_replace(path: &Path, dataset: &Dataset) -> StorageResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let (header, rows) = Self::header_and_rows(dataset);
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file());
            writer.write_record(&header)?;
            for row in rows {
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }

    /// Append rows, writing the header only when the file is new
    fn write_append(path: &Path, dataset: &Dataset) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let write_header = !path.exists();
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;

        let (header, rows) = Self::header_and_rows(dataset);
        let mut writer = csv::Writer::from_writer(file);
        if write_header {
            writer.write_record(&header)?;
        }
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| StorageError::IoError(io::Error::other(e.to_string())))?
            .flush()?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    #[instrument(skip(self))]
    async fn load_table(&self, id: &str) -> StorageResult<Option<Dataset>> {
        let path = self.path_for(id);
        debug!("load table data from file: {}", path.display());
        let schema = self.schemas.get(id).cloned();
        blocking(move || {
            if !path.exists() {
                info!("file not found: {}", path.display());
                return Ok(None);
            }
            Self::read_table(&path, schema.as_ref()).map(Some)
        })
        .await
    }

    #[instrument(skip(self, dataset), fields(rows = dataset.len()))]
    async fn save_table(&self, id: &str, dataset: &Dataset, mode: SaveMode) -> StorageResult<()> {
        if dataset.is_empty() {
            return Ok(());
        }
        let path = self.path_for(id);
        debug!("save table data to file: {} ({})", path.display(), mode);
        let dataset = dataset.clone();
        match mode {
            SaveMode::Replace => blocking(move || Self::write_replace(&path, &dataset)).await,
            SaveMode::Append => blocking(move || Self::write_append(&path, &dataset)).await,
            SaveMode::Sync => Err(StorageError::InvalidMode {
                backend: self.kind(),
                mode: mode.to_string(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn load_time_series(&self, id: &str, range: TimeRange) -> StorageResult<Option<Dataset>> {
        let path = self.path_for(id);
        debug!("load time-series data from file: {}", path.display());
        blocking(move || {
            if !path.exists() {
                info!("file not found: {}", path.display());
                return Ok(None);
            }
            Self::read_series(&path, range).map(Some)
        })
        .await
    }

    #[instrument(skip(self, dataset, _tag_keys), fields(rows = dataset.len()))]
    async fn save_time_series(
        &self,
        id: &str,
        dataset: &Dataset,
        _tag_keys: &[String],
    ) -> StorageResult<()> {
        if dataset.is_empty() {
            return Ok(());
        }
        let path = self.path_for(id);
        debug!("save time-series data to file: {}", path.display());
        let dataset = dataset.clone();
        blocking(move || Self::write_append(&path, &dataset)).await
    }
}
