use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::trace;

use crate::storage::error::{StorageError, StorageResult};
use crate::util;

/// Store configuration
///
/// Every section is optional in the JSON file; values missing there are
/// taken from the environment (see [`crate::util`]).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StoreConfig {
    /// Root directory of the file and streaming backends
    #[serde(default = "util::get_datadrive")]
    pub datadrive: PathBuf,

    pub relational: Option<RelationalConfig>,

    pub influx: Option<InfluxConfig>,

    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Poll interval of the export worker in milliseconds
    #[serde(default = "default_export_poll_ms")]
    pub export_poll_ms: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RelationalConfig {
    /// Full connection URL (`postgres://...` or `sqlite://...`)
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "util::get_influx_url")]
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Retry budget of streaming snapshot reads
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Doubling delays from `initial_backoff` up to `max_backoff`, without
    /// jitter or an elapsed-time limit; `max_attempts` is enforced by the
    /// retried operation
    pub fn exponential_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        StreamingConfig::default().retry_policy()
    }
}

impl StreamingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    50
}

fn default_initial_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    200
}

fn default_export_poll_ms() -> u64 {
    1000
}

impl StoreConfig {
    /// Configuration rooted at `datadrive`, everything else from the
    /// environment
    pub fn new(datadrive: impl AsRef<Path>) -> Self {
        Self {
            datadrive: datadrive.as_ref().to_path_buf(),
            relational: None,
            influx: None,
            streaming: StreamingConfig::default(),
            export_poll_ms: default_export_poll_ms(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(util::get_datadrive())
    }

    pub fn with_relational_url(mut self, url: impl Into<String>) -> Self {
        self.relational = Some(RelationalConfig { url: url.into() });
        self
    }

    pub fn with_influx(mut self, influx: InfluxConfig) -> Self {
        self.influx = Some(influx);
        self
    }

    pub fn export_poll_interval(&self) -> Duration {
        Duration::from_millis(self.export_poll_ms)
    }

    /// Connection URL of the relational store.
    ///
    /// Order: config file, `DATABASE_URL`, then a Postgres URL assembled
    /// from `POSTGRES_USER`/`POSTGRES_PASSWORD`/`POSTGRES_DATABASE` and the
    /// fixed host.
    pub fn relational_url(&self) -> StorageResult<String> {
        if let Some(relational) = &self.relational {
            return Ok(relational.url.clone());
        }
        if let Some(url) = util::get_database_url() {
            return Ok(url);
        }
        let (user, password, database) = util::get_postgres_credentials().ok_or_else(|| {
            StorageError::InvalidConfig(format!(
                "relational backend needs DATABASE_URL or {}",
                util::postgres_variables().join("/")
            ))
        })?;
        Ok(format!(
            "postgres://{}:{}@{}/{}",
            user,
            password,
            util::get_postgres_host(),
            database
        ))
    }

    pub fn influx_settings(&self) -> StorageResult<InfluxConfig> {
        if let Some(influx) = &self.influx {
            return Ok(influx.clone());
        }
        match (
            util::get_influx_token(),
            util::get_influx_org(),
            util::get_influx_bucket(),
        ) {
            (Some(token), Some(org), Some(bucket)) => Ok(InfluxConfig {
                url: util::get_influx_url(),
                token,
                org,
                bucket,
            }),
            _ => Err(StorageError::InvalidConfig(format!(
                "time-series backend needs {}",
                util::influx_variables().join("/")
            ))),
        }
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<StoreConfig> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: StoreConfig = serde_json::from_str(
            r#"{
                "datadrive": "/data",
                "relational": { "url": "sqlite://store.db" },
                "streaming": { "max_attempts": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.datadrive, PathBuf::from("/data"));
        assert_eq!(config.relational_url().unwrap(), "sqlite://store.db");
        assert_eq!(config.streaming.max_attempts, 3);
        assert_eq!(config.streaming.initial_backoff_ms, 5);
        assert_eq!(config.export_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_is_capped() {
        use backoff::backoff::Backoff;

        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(30),
        };
        let mut backoff = policy.exponential_backoff();
        let delays: Vec<Duration> = (0..6).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 30, 30, 30].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn test_explicit_influx_settings_win() {
        let influx = InfluxConfig {
            url: "http://localhost:8086".into(),
            token: "t".into(),
            org: "o".into(),
            bucket: "b".into(),
        };
        let config = StoreConfig::new("/tmp").with_influx(influx.clone());
        assert_eq!(config.influx_settings().unwrap(), influx);
    }
}
