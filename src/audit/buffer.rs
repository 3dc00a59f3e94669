//! Buffered ingestion.
//!
//! Entries are validated on submit and queued in a bounded buffer. A
//! background task commits the queue on an interval or once the flush
//! threshold is reached. A full buffer makes the submitting caller flush
//! synchronously; a failed flush puts the batch back at the head of the queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audit::entry::{NewAuditEntry, ValidatedEntry};
use crate::audit::logger::AuditLogger;
use crate::config::BufferConfig;
use crate::error::AuditResult;

struct BufferState {
    logger: AuditLogger,
    pending: Mutex<VecDeque<ValidatedEntry>>,
    flush_lock: Mutex<()>,
    threshold_reached: Notify,
    capacity: usize,
    flush_threshold: usize,
}

impl BufferState {
    async fn flush(&self) -> AuditResult<usize> {
        let _flushing = self.flush_lock.lock().await;

        let batch: Vec<ValidatedEntry> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match self.logger.append(&batch).await {
            Ok(receipts) => {
                debug!("Flushed {} buffered audit entries", receipts.len());
                Ok(receipts.len())
            }
            Err(e) => {
                let count = batch.len();
                let mut pending = self.pending.lock().await;
                for entry in batch.into_iter().rev() {
                    pending.push_front(entry);
                }
                warn!("Buffered flush of {} entries failed, re-queued: {}", count, e);
                Err(e)
            }
        }
    }
}

pub struct BufferedAuditLogger {
    state: Arc<BufferState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<usize>>>,
}

impl BufferedAuditLogger {
    /// Start the buffer and its background flush task.
    pub fn start(logger: AuditLogger, config: &BufferConfig) -> Self {
        let state = Arc::new(BufferState {
            logger,
            pending: Mutex::new(VecDeque::with_capacity(config.capacity)),
            flush_lock: Mutex::new(()),
            threshold_reached: Notify::new(),
            capacity: config.capacity.max(1),
            flush_threshold: config.flush_threshold.clamp(1, config.capacity.max(1)),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_flusher(
            Arc::clone(&state),
            config.flush_interval(),
            shutdown_rx,
        ));

        Self {
            state,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Validate and enqueue. Returns once the entry is buffered, not
    /// committed; call [`flush`](Self::flush) for durability.
    pub async fn submit(&self, entry: NewAuditEntry) -> AuditResult<()> {
        let entry = entry.validate(None)?;

        loop {
            {
                let mut pending = self.state.pending.lock().await;
                if pending.len() < self.state.capacity {
                    pending.push_back(entry);
                    if pending.len() >= self.state.flush_threshold {
                        self.state.threshold_reached.notify_one();
                    }
                    return Ok(());
                }
            }
            // Backpressure: the caller pays for the flush.
            self.state.flush().await?;
        }
    }

    /// Commit everything buffered so far.
    pub async fn flush(&self) -> AuditResult<usize> {
        self.state.flush().await
    }

    pub async fn pending(&self) -> usize {
        self.state.pending.lock().await.len()
    }

    /// Stop the background task and flush what is left.
    pub async fn shutdown(&self) -> AuditResult<usize> {
        let _ = self.shutdown_tx.send(true);
        let mut flushed = 0;
        if let Some(task) = self.task.lock().await.take() {
            match task.await {
                Ok(count) => flushed += count,
                Err(e) => warn!("Audit flush task ended abnormally: {}", e),
            }
        }
        // Retries whatever the task's final flush could not write.
        flushed += self.state.flush().await?;
        info!("Audit buffer shut down, {} entries flushed", flushed);
        Ok(flushed)
    }
}

async fn run_flusher(
    state: Arc<BufferState>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> usize {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.threshold_reached.notified() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }

        if let Err(e) = state.flush().await {
            warn!("Background audit flush failed: {}", e);
        }
    }

    // Covers a logger dropped without `shutdown`: the sender closes and
    // whatever is still queued is committed before the task exits.
    match state.flush().await {
        Ok(count) => count,
        Err(e) => {
            let left = state.pending.lock().await.len();
            warn!("Final audit flush failed, {} entries left unwritten: {}", left, e);
            0
        }
    }
}
