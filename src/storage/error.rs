//! Error types for storage operations

use std::fmt;

use super::backend::BackendKind;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
///
/// "Not found" is deliberately absent: missing tables, files and snapshots
/// surface as `Ok(None)` from the load operations.
#[derive(Debug)]
pub enum StorageError {
    /// Database connection failed
    ConnectionFailed(String),

    /// Database query failed
    QueryFailed(String),

    /// Invalid configuration (unknown backend name, missing credentials, ...)
    InvalidConfig(String),

    /// The backend does not implement the requested operation, or was not
    /// connected on this handler
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },

    /// The save mode is not valid for the backend
    InvalidMode { backend: BackendKind, mode: String },

    /// Encoding or decoding of stored data failed
    SerializationError(String),

    /// A streaming snapshot could not be decoded within the retry budget
    CorruptSnapshot { path: String, attempts: u32 },

    /// Backend-specific error (HTTP status, protocol violation, ...)
    BackendError(String),

    /// Dropping the staging table failed after the sync upsert committed
    StagingCleanupFailed { table: String, reason: String },

    /// The export worker has stopped and no longer accepts items
    WorkerStopped,

    /// I/O error (file access, etc.)
    IoError(std::io::Error),

    /// A backend fault, tagged with the backend kind and dataset id it
    /// occurred on
    Backend {
        backend: BackendKind,
        id: String,
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Wrap `self` with the backend kind and dataset id of the failing call
    pub fn context(self, backend: BackendKind, id: impl Into<String>) -> Self {
        StorageError::Backend {
            backend,
            id: id.into(),
            source: Box::new(self),
        }
    }

    /// The underlying fault with any backend context peeled off
    pub fn root(&self) -> &StorageError {
        match self {
            StorageError::Backend { source, .. } => source.root(),
            other => other,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to storage backend: {}", msg)
            }
            StorageError::QueryFailed(msg) => write!(f, "storage query failed: {}", msg),
            StorageError::InvalidConfig(msg) => write!(f, "invalid storage configuration: {}", msg),
            StorageError::Unsupported { backend, operation } => {
                write!(f, "{} backend does not support {}", backend, operation)
            }
            StorageError::InvalidMode { backend, mode } => {
                write!(f, "invalid save mode '{}' for {} backend", mode, backend)
            }
            StorageError::SerializationError(msg) => write!(f, "serialization error: {}", msg),
            StorageError::CorruptSnapshot { path, attempts } => write!(
                f,
                "snapshot {} still unreadable after {} attempts",
                path, attempts
            ),
            StorageError::BackendError(msg) => write!(f, "storage backend error: {}", msg),
            StorageError::StagingCleanupFailed { table, reason } => write!(
                f,
                "data committed but staging table {} could not be dropped: {}",
                table, reason
            ),
            StorageError::WorkerStopped => f.write_str("export worker has stopped"),
            StorageError::IoError(err) => write!(f, "I/O error: {}", err),
            StorageError::Backend {
                backend,
                id,
                source,
            } => write!(f, "{} backend failed on {}: {}", backend, id, source),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::IoError(err) => Some(err),
            StorageError::Backend { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError(err)
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::IoError(io_err),
            sqlx::Error::RowNotFound => StorageError::QueryFailed("no rows found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::ConnectionFailed(err.to_string())
            }
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            StorageError::ConnectionFailed(err.to_string())
        } else {
            StorageError::BackendError(err.to_string())
        }
    }
}

impl From<csv::Error> for StorageError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(io_err) => StorageError::IoError(io_err),
                other => StorageError::SerializationError(format!("{:?}", other)),
            }
        } else {
            StorageError::SerializationError(err.to_string())
        }
    }
}

impl From<tempfile::PersistError> for StorageError {
    fn from(err: tempfile::PersistError) -> Self {
        StorageError::IoError(err.error)
    }
}
