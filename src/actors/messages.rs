//! Message types for the export worker

use std::fmt;

/// One queued unit of export work
#[derive(Debug, Clone, PartialEq)]
pub struct ExportItem<P> {
    /// Name of the stream (series) the payload belongs to
    pub stream_id: String,

    /// Opaque to the worker; handed to the sink unchanged
    pub payload: P,
}

impl<P> ExportItem<P> {
    pub fn new(stream_id: impl Into<String>, payload: P) -> Self {
        Self {
            stream_id: stream_id.into(),
            payload,
        }
    }
}

/// Lifecycle of an export worker
///
/// `Running` until a stop is requested, `Draining` while items queued
/// before (or racing with) the stop are still being exported, `Stopped`
/// once the queue was observed empty after the stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Running => f.write_str("running"),
            WorkerState::Draining => f.write_str("draining"),
            WorkerState::Stopped => f.write_str("stopped"),
        }
    }
}
