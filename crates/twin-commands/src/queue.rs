//! Bounded transmit queue.
//!
//! Every downlink goes through a small bounded channel. Producers wait while
//! the queue is full, which throttles bursts of simultaneous retries. A single
//! worker drains the queue into the real publisher.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twin_core::{DownlinkCommand, DownlinkTransport, Error, Result};

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Transmit queue is closed")]
    Closed,
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Producer side of the transmit queue.
#[derive(Clone)]
pub struct TransmitQueue {
    sender: mpsc::Sender<DownlinkCommand>,
}

impl TransmitQueue {
    /// Create a queue with the given capacity, returning the consumer end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DownlinkCommand>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue a command, waiting for space.
    pub async fn enqueue(&self, command: DownlinkCommand) -> std::result::Result<(), QueueError> {
        self.sender.send(command).await.map_err(|_| QueueError::Closed)
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.sender.capacity()
    }
}

#[async_trait]
impl DownlinkTransport for TransmitQueue {
    async fn send(&self, command: DownlinkCommand) -> Result<()> {
        Ok(self.enqueue(command).await?)
    }
}

/// Worker statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Commands handed to the publisher
    pub commands_sent: u64,
    /// Commands the publisher rejected
    pub commands_failed: u64,
    /// Last publish error
    pub last_error: Option<String>,
}

/// Drains the transmit queue into a publisher.
pub struct TransmitWorker {
    stats: Arc<RwLock<WorkerStats>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TransmitWorker {
    /// Start draining `receiver` into `publisher`.
    ///
    /// A failed publish is logged and the worker moves on to the next command.
    pub fn spawn(
        mut receiver: mpsc::Receiver<DownlinkCommand>,
        publisher: Arc<dyn DownlinkTransport>,
    ) -> Self {
        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        let cancel = CancellationToken::new();

        let worker_stats = stats.clone();
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    command = receiver.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };

                let device_id = command.device_id.clone();
                let field_index = command.field_index;
                match publisher.send(command).await {
                    Ok(()) => {
                        debug!(device_id = %device_id, field_index, "Published downlink");
                        worker_stats.write().await.commands_sent += 1;
                    }
                    Err(e) => {
                        warn!(device_id = %device_id, field_index, "Failed to publish downlink: {}", e);
                        let mut stats = worker_stats.write().await;
                        stats.commands_failed += 1;
                        stats.last_error = Some(e.to_string());
                    }
                }
            }
            info!("Transmit worker stopped");
        });

        Self {
            stats,
            cancel,
            handle,
        }
    }

    /// Get worker statistics.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.ok();
    }
}
