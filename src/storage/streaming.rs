//! Streaming snapshot backend
//!
//! Each stream is a single snapshot file at `<datadrive>/<id>.snapshot`
//! that is rewritten as a whole on every save. A snapshot is laid out as:
//!
//! ```text
//! magic "SDSS" (4) | version u16 LE (2) | payload length u64 LE (8) | crc32 u32 LE (4) | payload
//! ```
//!
//! The payload is the bincode encoding of the dataset. Writers go through a
//! temp file and a rename, but a reader on a filesystem without atomic
//! rename can still observe a partial file; reads therefore retry through
//! `backoff::future::retry` until the snapshot decodes cleanly or
//! `RetryPolicy::max_attempts` reads have failed.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::backend::{BackendKind, StorageBackend, TimeRange};
use super::dataset::Dataset;
use super::error::{StorageError, StorageResult};
use crate::config::RetryPolicy;

const MAGIC: &[u8; 4] = b"SDSS";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 8 + 4;
const EXTENSION: &str = "snapshot";

/// Why a snapshot could not be decoded
#[derive(Debug)]
enum DecodeError {
    Truncated { expected: usize, actual: usize },
    BadMagic,
    UnknownVersion(u16),
    ChecksumMismatch { expected: u32, actual: u32 },
    Payload(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated { expected, actual } => {
                write!(f, "truncated snapshot ({} of {} bytes)", actual, expected)
            }
            DecodeError::BadMagic => write!(f, "bad magic"),
            DecodeError::UnknownVersion(v) => write!(f, "unknown snapshot version {}", v),
            DecodeError::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch (expected {:08x}, got {:08x})",
                expected, actual
            ),
            DecodeError::Payload(msg) => write!(f, "undecodable payload: {}", msg),
        }
    }
}

pub(crate) fn encode_snapshot(dataset: &Dataset) -> StorageResult<Vec<u8>> {
    let payload =
        bincode::serialize(dataset).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let crc = crc32fast::hash(&payload);

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_snapshot(bytes: &[u8]) -> Result<Dataset, DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    if &bytes[0..4] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(DecodeError::UnknownVersion(version));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[6..14]);
    let len = u64::from_le_bytes(len) as usize;
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[14..18]);
    let expected_crc = u32::from_le_bytes(crc);

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != len {
        return Err(DecodeError::Truncated {
            expected: HEADER_SIZE + len,
            actual: bytes.len(),
        });
    }
    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(DecodeError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }
    bincode::deserialize(payload).map_err(|e| DecodeError::Payload(e.to_string()))
}

/// Snapshot-per-stream backend for time-indexed data
pub struct StreamingBackend {
    root: PathBuf,
    retry: RetryPolicy,
}

impl StreamingBackend {
    pub fn new(root: impl AsRef<Path>, retry: RetryPolicy) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            retry,
        }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        let relative = Path::new(id);
        if relative.extension().is_some_and(|ext| ext == EXTENSION) {
            self.root.join(relative)
        } else {
            self.root.join(format!("{id}.{EXTENSION}"))
        }
    }
}

#[async_trait]
impl StorageBackend for StreamingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    /// Range bounds are ignored: the whole snapshot is returned.
    #[instrument(skip(self, _range))]
    async fn load_time_series(&self, id: &str, _range: TimeRange) -> StorageResult<Option<Dataset>> {
        let path = self.path_for(id);
        debug!("load time-series data streaming: {}", path.display());

        let path = path.as_path();
        let max_attempts = self.retry.max_attempts;
        let mut attempt = 0u32;
        let read = move || {
            attempt += 1;
            let attempt = attempt;
            async move {
                let bytes = match tokio::fs::read(path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        info!("snapshot not found: {}", path.display());
                        return Ok(None);
                    }
                    Err(e) => return Err(backoff::Error::permanent(StorageError::from(e))),
                };

                match decode_snapshot(&bytes) {
                    Ok(mut dataset) => {
                        dataset.normalize_time_index();
                        Ok(Some(dataset))
                    }
                    Err(e) => {
                        let corrupt = StorageError::CorruptSnapshot {
                            path: path.display().to_string(),
                            attempts: attempt,
                        };
                        if attempt >= max_attempts {
                            warn!(
                                "giving up on snapshot {} after {} attempts: {}",
                                path.display(),
                                attempt,
                                e
                            );
                            Err(backoff::Error::permanent(corrupt))
                        } else {
                            debug!("snapshot {} not readable yet: {}", path.display(), e);
                            Err(backoff::Error::transient(corrupt))
                        }
                    }
                }
            }
        };

        backoff::future::retry(self.retry.exponential_backoff(), read).await
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
        debug!("save time-series data streaming: {}", path.display());

        let mut normalized = dataset.clone();
        normalized.normalize_time_index();
        let bytes = encode_snapshot(&normalized)?;

        let parent = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::IoError(io::Error::other(e)))?
    }
}
