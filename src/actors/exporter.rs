//! ExportWorker - drains queued payloads into storage
//!
//! Producers enqueue `(stream id, payload)` pairs without waiting for the
//! write; a single spawned task forwards them one at a time, in FIFO
//! order, to an [`ExportSink`].
//!
//! ## Shutdown
//!
//! `request_stop` only raises a flag. The worker keeps exporting until it
//! sees the flag set *and* the queue empty at the same check, so items
//! enqueued before the stop (or racing with it) are still written. At that
//! point the queue is closed: every `enqueue` that returned `Ok` is
//! exported, later ones fail with `StorageError::WorkerStopped`. Every
//! wait on the queue is bounded by the poll interval, which keeps the
//! reaction to the flag prompt while idle.
//!
//! The queue is unbounded: a sink slower than its producers grows memory
//! without backpressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace};

use super::messages::{ExportItem, WorkerState};
use crate::storage::{StorageError, StorageResult};

/// Poll interval used when none is configured
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Destination of exported payloads
#[async_trait]
pub trait ExportSink<P>: Send + Sync + 'static {
    async fn export(&self, stream_id: &str, payload: P) -> StorageResult<()>;
}

/// The worker task; owned by the spawned task, controlled via [`ExportHandle`]
pub struct ExportWorker<P, S> {
    sink: S,
    queue: mpsc::UnboundedReceiver<ExportItem<P>>,
    stop: Arc<AtomicBool>,
    state: watch::Sender<WorkerState>,
    poll_interval: Duration,
    processed: u64,
}

impl<P, S> ExportWorker<P, S>
where
    P: Send + 'static,
    S: ExportSink<P>,
{
    /// Spawn a worker exporting into `sink`
    pub fn spawn(sink: S, poll_interval: Duration) -> ExportHandle<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(WorkerState::Running);

        let worker = Self {
            sink,
            queue: rx,
            stop: stop.clone(),
            state: state_tx,
            poll_interval,
            processed: 0,
        };
        let task = tokio::spawn(worker.run());

        ExportHandle {
            producer: ExportProducer { sender: tx },
            stop,
            state: state_rx,
            task,
        }
    }

    #[instrument(skip(self), fields(poll_ms = self.poll_interval.as_millis() as u64))]
    async fn run(mut self) -> u64 {
        info!("export worker started");
        loop {
            match time::timeout(self.poll_interval, self.queue.recv()).await {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => {
                    debug!("all producers dropped and queue drained");
                    break;
                }
                Err(_) => trace!("queue idle for {:?}", self.poll_interval),
            }

            if self.stop.load(Ordering::Acquire) {
                if self.queue.is_empty() {
                    // Refuse further sends, then export whatever slipped in
                    // between the check and the close
                    self.queue.close();
                    while let Ok(item) = self.queue.try_recv() {
                        self.process(item).await;
                    }
                    break;
                }
                if *self.state.borrow() == WorkerState::Running {
                    debug!("stop requested, draining {} queued items", self.queue.len());
                    self.state.send_replace(WorkerState::Draining);
                }
            }
        }
        self.state.send_replace(WorkerState::Stopped);
        info!(processed = self.processed, "export worker stopped");
        self.processed
    }

    /// Export one item; a failure is logged and does not stop the loop
    async fn process(&mut self, item: ExportItem<P>) {
        let ExportItem { stream_id, payload } = item;
        match self.sink.export(&stream_id, payload).await {
            Ok(()) => debug!("exported {}", stream_id),
            Err(e) => error!("export of {} failed: {}", stream_id, e),
        }
        self.processed += 1;
    }
}

/// Cloneable enqueue side of a worker, for producers on other tasks
pub struct ExportProducer<P> {
    sender: mpsc::UnboundedSender<ExportItem<P>>,
}

impl<P> Clone for ExportProducer<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<P> ExportProducer<P> {
    /// Queue a payload; never waits
    pub fn enqueue(&self, stream_id: impl Into<String>, payload: P) -> StorageResult<()> {
        self.sender
            .send(ExportItem::new(stream_id, payload))
            .map_err(|_| StorageError::WorkerStopped)
    }
}

/// Handle for controlling an [`ExportWorker`]
pub struct ExportHandle<P> {
    producer: ExportProducer<P>,
    stop: Arc<AtomicBool>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<u64>,
}

impl<P> ExportHandle<P> {
    pub fn enqueue(&self, stream_id: impl Into<String>, payload: P) -> StorageResult<()> {
        self.producer.enqueue(stream_id, payload)
    }

    pub fn producer(&self) -> ExportProducer<P> {
        self.producer.clone()
    }

    /// Ask the worker to stop once the queue is empty
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Wait for the worker to stop and return the number of items it
    /// processed (failed exports included).
    ///
    /// Returns once a requested stop has drained the queue, or once every
    /// producer is gone and the queue is empty.
    pub async fn join(self) -> StorageResult<u64> {
        drop(self.producer);
        self.task
            .await
            .map_err(|e| StorageError::BackendError(format!("export worker task failed: {}", e)))
    }
}
