//! Background export
//!
//! Producers hand finished payloads to an [`ExportWorker`] and move on; the
//! worker runs as its own tokio task and writes them through an
//! [`ExportSink`] one at a time.
//!
//! ```text
//!   producer ──┐
//!   producer ──┼── unbounded mpsc ──► ExportWorker ──► ExportSink ──► StorageHandler
//!   producer ──┘   (FIFO)              (single task)   (DynamicDataExporter)
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Queue**: `ExportItem`s travel over an unbounded mpsc channel
//! 2. **Stop flag**: an `AtomicBool` shared with the handle, polled between items
//! 3. **State**: `WorkerState` is published on a watch channel

pub mod exporter;
pub mod messages;

pub use exporter::{
    DEFAULT_POLL_INTERVAL, ExportHandle, ExportProducer, ExportSink, ExportWorker,
};
pub use messages::{ExportItem, WorkerState};
