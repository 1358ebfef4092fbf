use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::{Batch, SealReason};
use crate::pool::PooledBuffer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("accumulator is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Item-count seal threshold.
    pub max_items: usize,
    /// Byte-volume seal threshold across the open batch's payloads.
    pub max_bytes: usize,
    /// A batch left open this long after its first append is sealed even if
    /// below both thresholds.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 512,
            max_bytes: 4 * 1024 * 1024,
            flush_interval: Duration::from_millis(500),
        }
    }
}

struct OpenBatch {
    items: Vec<PooledBuffer>,
    bytes: usize,
    opened_at: Option<Instant>,
    /// Bumped on every seal. A flush timer armed for an older epoch observes
    /// the mismatch and becomes a no-op, so exactly one seal happens per
    /// batch no matter how the size and interval triggers race.
    epoch: u64,
    /// Taken at close; a missing sender rejects further appends.
    tx: Option<mpsc::Sender<Batch>>,
}

struct AccumulatorInner {
    config: BatchConfig,
    open: Mutex<OpenBatch>,
    seq: AtomicU64,
    timers: CancellationToken,
}

/// Collects borrowed buffers into batches and hands sealed batches to the
/// dispatch channel.
///
/// The hand-off happens while the open-batch lock is held, so submission
/// order equals seal order and a full dispatch channel backpressures the
/// sealer. A fresh batch is open for producers the moment the previous one
/// seals.
#[derive(Clone)]
pub struct BatchAccumulator {
    inner: Arc<AccumulatorInner>,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig, dispatch_tx: mpsc::Sender<Batch>) -> Self {
        Self {
            inner: Arc::new(AccumulatorInner {
                config,
                open: Mutex::new(OpenBatch {
                    items: Vec::new(),
                    bytes: 0,
                    opened_at: None,
                    epoch: 0,
                    tx: Some(dispatch_tx),
                }),
                seq: AtomicU64::new(0),
                timers: CancellationToken::new(),
            }),
        }
    }

    /// Appends a borrowed buffer to the open batch.
    ///
    /// Returns whether this append sealed the batch. A rejected append drops
    /// the buffer, which returns it to its pool.
    pub async fn append(&self, buffer: PooledBuffer) -> Result<bool, AccumulatorError> {
        let mut arm: Option<(u64, tokio::time::Instant)> = None;
        let sealed = {
            let mut open = self.inner.open.lock().await;
            if open.tx.is_none() {
                return Err(AccumulatorError::Closed);
            }
            if open.items.is_empty() {
                open.opened_at = Some(Instant::now());
                arm = Some((
                    open.epoch,
                    tokio::time::Instant::now() + self.inner.config.flush_interval,
                ));
            }
            open.bytes += buffer.readable_bytes();
            open.items.push(buffer);

            let reason = if open.items.len() >= self.inner.config.max_items {
                Some(SealReason::Size)
            } else if open.bytes >= self.inner.config.max_bytes {
                Some(SealReason::Bytes)
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    let batch = self.seal_locked(&mut open, reason);
                    debug!(
                        batch_id = %batch.id(),
                        items = batch.len(),
                        bytes = batch.byte_size(),
                        ?reason,
                        "threshold flush"
                    );
                    self.send_locked(&open, batch).await?;
                    true
                }
                None => false,
            }
        };
        if let Some((epoch, deadline)) = arm {
            self.arm_flush_timer(epoch, deadline);
        }
        Ok(sealed)
    }

    /// Number of items in the open batch.
    pub async fn pending(&self) -> usize {
        self.inner.open.lock().await.items.len()
    }

    /// Seals and hands off any open items, then closes the dispatch channel.
    /// Further appends are rejected. Returns whether a final batch went out.
    pub async fn close(&self) -> bool {
        self.inner.timers.cancel();
        let mut open = self.inner.open.lock().await;
        let flushed = if open.items.is_empty() || open.tx.is_none() {
            false
        } else {
            let batch = self.seal_locked(&mut open, SealReason::Drain);
            info!(batch_id = %batch.id(), items = batch.len(), "drain flush");
            self.send_locked(&open, batch).await.is_ok()
        };
        open.tx = None;
        flushed
    }

    fn seal_locked(&self, open: &mut OpenBatch, reason: SealReason) -> Batch {
        open.epoch += 1;
        let items = std::mem::take(&mut open.items);
        let bytes = std::mem::replace(&mut open.bytes, 0);
        let created_at = open.opened_at.take().unwrap_or_else(Instant::now);
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        Batch::new(seq, items, bytes, created_at, reason)
    }

    async fn send_locked(&self, open: &OpenBatch, batch: Batch) -> Result<(), AccumulatorError> {
        let tx = open.tx.as_ref().ok_or(AccumulatorError::Closed)?;
        if tx.send(batch).await.is_err() {
            // Receiver gone mid-shutdown; the dropped batch hands its buffers
            // back to the pool.
            warn!("dispatch channel closed, sealed batch returned to pool");
            return Err(AccumulatorError::Closed);
        }
        Ok(())
    }

    fn arm_flush_timer(&self, epoch: u64, deadline: tokio::time::Instant) {
        let acc = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = acc.inner.timers.cancelled() => {}
                () = sleep_until(deadline) => acc.flush_on_interval(epoch).await,
            }
        });
    }

    async fn flush_on_interval(&self, epoch: u64) {
        let mut open = self.inner.open.lock().await;
        if open.epoch != epoch || open.items.is_empty() {
            // A size or drain seal won the race for this batch.
            return;
        }
        let batch = self.seal_locked(&mut open, SealReason::Interval);
        debug!(
            batch_id = %batch.id(),
            items = batch.len(),
            bytes = batch.byte_size(),
            "interval flush"
        );
        let _ = self.send_locked(&open, batch).await;
    }
}
