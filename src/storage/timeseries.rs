//! Time-series storage backend (InfluxDB v2 HTTP API)
//!
//! A stream id is an InfluxDB measurement. Reads run a Flux
//! range/filter/pivot pipeline and merge the CSV response into one row per
//! timestamp; writes send line protocol in batches.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, SecondsFormat};
use reqwest::Client;
use tracing::{debug, info, instrument};

use super::backend::{BackendKind, StorageBackend, TimeRange};
use super::dataset::{Column, Dataset, TIME_INDEX};
use super::error::{StorageError, StorageResult};
use super::value::{Value, parse_timestamp};
use crate::config::InfluxConfig;

/// Lines per write request
const WRITE_BATCH_SIZE: usize = 5000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Columns of the CSV response that are not data
const RESPONSE_METADATA: [&str; 3] = ["", "result", "table"];

pub struct TimeSeriesBackend {
    client: Client,
    config: InfluxConfig,
}

impl TimeSeriesBackend {
    pub fn new(config: InfluxConfig) -> StorageResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.config.token)
    }

    /// Flux pipeline for `measurement` over `[start, stop)`
    pub fn flux_query(&self, measurement: &str, range: TimeRange) -> String {
        let start = range
            .start
            .map(flux_time)
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());
        let stop = range.end.map(flux_time).unwrap_or_else(|| "now()".to_string());
        format!(
            "from(bucket: \"{bucket}\")\n\
             \x20 |> range(start: {start}, stop: {stop})\n\
             \x20 |> filter(fn: (r) => r._measurement == \"{measurement}\")\n\
             \x20 |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")\n\
             \x20 |> drop(columns: [\"_start\", \"_stop\", \"_measurement\"])",
            bucket = flux_string(&self.config.bucket),
            measurement = flux_string(measurement),
        )
    }

    async fn post(
        &self,
        path: &str,
        query: &[(&str, &str)],
        content_type: &str,
        accept: Option<&str>,
        body: String,
    ) -> StorageResult<String> {
        let mut request = self
            .client
            .post(self.endpoint(path))
            .query(query)
            .header("Authorization", self.authorization())
            .header("Content-Type", content_type);
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StorageError::BackendError(format!(
                "InfluxDB {} returned {}: {}",
                path,
                status,
                text.trim()
            )));
        }
        Ok(text)
    }
}

fn flux_time(t: NaiveDateTime) -> String {
    t.and_utc().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn flux_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Merge the (possibly multi-table) CSV response into one dataset, one row
/// per timestamp, sorted by time and column name
pub fn parse_query_response(body: &str) -> StorageResult<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut rows: BTreeMap<NaiveDateTime, BTreeMap<String, Value>> = BTreeMap::new();
    let mut names: BTreeSet<String> = BTreeSet::new();
    let mut header: Vec<String> = Vec::new();

    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.get(1) == Some("result") && record.get(2) == Some("table") {
            header = record.iter().map(str::to_string).collect();
            continue;
        }
        let Some(time_pos) = header.iter().position(|h| h == "_time") else {
            continue;
        };
        let Some(time) = record.get(time_pos).and_then(parse_timestamp) else {
            continue;
        };

        let row = rows.entry(time).or_default();
        for (name, cell) in header.iter().zip(record.iter()) {
            if name == "_time" || RESPONSE_METADATA.contains(&name.as_str()) {
                continue;
            }
            let value = Value::infer(cell);
            if value.is_null() && row.contains_key(name) {
                continue;
            }
            names.insert(name.clone());
            row.insert(name.clone(), value);
        }
    }

    let index = Column::new(
        TIME_INDEX,
        rows.keys().map(|t| Value::Timestamp(*t)).collect(),
    );
    let columns = names
        .iter()
        .map(|name| {
            Column::new(
                name.clone(),
                rows.values()
                    .map(|row| row.get(name).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect();
    Ok(Dataset::new(Some(index), columns))
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Int(_) | Value::Float(_) => value
            .as_f64()
            .filter(|v| v.is_finite())
            .map(|v| format!("{:?}", v)),
        Value::Bool(v) => Some(v.to_string()),
        Value::Str(_) | Value::Timestamp(_) => Some(format!(
            "\"{}\"",
            value.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )),
    }
}

/// Line protocol for every row of `dataset`; rows without a timestamp or
/// without any field are skipped
pub fn to_line_protocol(measurement: &str, dataset: &Dataset, tag_keys: &[String]) -> Vec<String> {
    let mut dataset = dataset.clone();
    dataset.normalize_time_index();
    let times = dataset.time_index();
    let (tags, fields) = dataset.split_columns(|name| tag_keys.iter().any(|k| k == name));
    let measurement = escape_measurement(measurement);

    times
        .iter()
        .enumerate()
        .filter_map(|(i, time)| {
            let nanos = time.and_then(|t| t.and_utc().timestamp_nanos_opt())?;

            let field_set: Vec<String> = fields
                .columns()
                .iter()
                .filter_map(|c| {
                    field_value(&c.values[i]).map(|v| format!("{}={}", escape_key(&c.name), v))
                })
                .collect();
            if field_set.is_empty() {
                return None;
            }

            let mut line = measurement.clone();
            for column in tags.columns() {
                let value = &column.values[i];
                if value.is_null() {
                    continue;
                }
                line.push(',');
                line.push_str(&escape_key(&column.name));
                line.push('=');
                line.push_str(&escape_key(&value.to_string()));
            }
            line.push(' ');
            line.push_str(&field_set.join(","));
            line.push(' ');
            line.push_str(&nanos.to_string());
            Some(line)
        })
        .collect()
}

#[async_trait]
impl StorageBackend for TimeSeriesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TimeSeries
    }

    #[instrument(skip(self))]
    async fn load_time_series(&self, id: &str, range: TimeRange) -> StorageResult<Option<Dataset>> {
        let flux = self.flux_query(id, range);
        debug!("load time-series data from InfluxDB: {}", id);

        let body = self
            .post(
                "/api/v2/query",
                &[("org", self.config.org.as_str())],
                "application/vnd.flux",
                Some("application/csv"),
                flux,
            )
            .await?;
        let dataset = parse_query_response(&body)?;
        debug!("loaded {} rows from measurement {}", dataset.len(), id);
        Ok(Some(dataset))
    }

    #[instrument(skip(self, dataset, tag_keys), fields(rows = dataset.len()))]
    async fn save_time_series(
        &self,
        id: &str,
        dataset: &Dataset,
        tag_keys: &[String],
    ) -> StorageResult<()> {
        if dataset.is_empty() {
            return Ok(());
        }
        let lines = to_line_protocol(id, dataset, tag_keys);
        debug!("save {} points to InfluxDB measurement {}", lines.len(), id);

        for batch in lines.chunks(WRITE_BATCH_SIZE) {
            self.post(
                "/api/v2/write",
                &[
                    ("org", self.config.org.as_str()),
                    ("bucket", self.config.bucket.as_str()),
                    ("precision", "ns"),
                ],
                "text/plain; charset=utf-8",
                None,
                batch.join("\n"),
            )
            .await?;
        }
        info!("wrote {} points to {}", lines.len(), id);
        Ok(())
    }
}
