pub mod http;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::failover::{FailedItem, FailoverHandler};
use crate::pool::BufferPool;

pub use http::{HttpChannelConfig, HttpChannelError, HttpDeliveryChannel};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("backend rejected the batch: HTTP {status}")]
    Rejected { status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("delivery cancelled during shutdown")]
    Cancelled,
}

/// One item the backend refused out of an otherwise accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedItem {
    /// Index of the item within its batch, in append order.
    pub index: usize,
    pub status: u16,
}

/// Outcome of a successful submission.
///
/// An empty `rejected` list means the backend accepted every item. Backends
/// that report per-item acceptance surface refusals here; only those items go
/// through failover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub rejected: Vec<RejectedItem>,
}

impl DeliveryReceipt {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn with_rejected(rejected: Vec<RejectedItem>) -> Self {
        Self { rejected }
    }
}

/// The delivery channel boundary: the embedding application supplies the
/// actual backend client (see [`HttpDeliveryChannel`] for the bundled one).
///
/// Implementations classify the outcome; they never see buffer ownership and
/// must not retain payload references past the returned future.
pub trait DeliveryChannel: Send + Sync + 'static {
    fn send<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, Result<DeliveryReceipt, DeliveryError>>;
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Batches concurrently in flight; further seals queue on the dispatch
    /// channel and backpressure producers.
    pub max_in_flight: usize,
    /// Grace period for in-flight deliveries at shutdown before they are
    /// cancelled and failed over.
    pub drain_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub batches_cancelled: u64,
    pub items_failed_over: u64,
}

#[derive(Default)]
struct DispatchCounters {
    batches_delivered: AtomicU64,
    batches_failed: AtomicU64,
    batches_cancelled: AtomicU64,
    items_failed_over: AtomicU64,
}

/// Pulls sealed batches off the dispatch channel and runs each delivery on
/// its own tracked task, bounded by the in-flight semaphore.
///
/// Completion is one code path regardless of outcome: failed or rejected
/// items go through the failover handler, then every buffer in the batch is
/// released. Delivery never leaks a buffer and never unwinds into producers.
pub(crate) struct Dispatcher {
    pool: BufferPool,
    channel: Arc<dyn DeliveryChannel>,
    failover: Arc<dyn FailoverHandler>,
    config: DispatchConfig,
    in_flight: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub(crate) fn new(
        pool: BufferPool,
        channel: Arc<dyn DeliveryChannel>,
        failover: Arc<dyn FailoverHandler>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Arc::new(Self {
            pool,
            channel,
            failover,
            config,
            in_flight,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            counters: DispatchCounters::default(),
        })
    }

    pub(crate) fn spawn_run(self: &Arc<Self>, rx: mpsc::Receiver<Batch>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(dispatcher.run(rx))
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Batch>) {
        while let Some(batch) = rx.recv().await {
            if self.cancel.is_cancelled() {
                self.complete(batch, Err(DeliveryError::Cancelled));
                continue;
            }
            let permit = tokio::select! {
                () = self.cancel.cancelled() => {
                    self.complete(batch, Err(DeliveryError::Cancelled));
                    continue;
                }
                permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.complete(batch, Err(DeliveryError::Cancelled));
                        continue;
                    }
                },
            };
            let dispatcher = Arc::clone(&self);
            self.tracker.spawn(async move {
                let _permit = permit;
                dispatcher.deliver(batch).await;
            });
        }
        debug!("dispatch channel drained");
    }

    async fn deliver(&self, batch: Batch) {
        let outcome = tokio::select! {
            () = self.cancel.cancelled() => Err(DeliveryError::Cancelled),
            outcome = self.channel.send(&batch) => outcome,
        };
        self.complete(batch, outcome);
    }

    /// Terminal handling for one batch: failover what the backend did not
    /// accept, then release every buffer back to the pool.
    fn complete(&self, batch: Batch, outcome: Result<DeliveryReceipt, DeliveryError>) {
        match outcome {
            Ok(receipt) if receipt.rejected.is_empty() => {
                debug!(
                    batch_id = %batch.id(),
                    seq = batch.seq(),
                    items = batch.len(),
                    "batch delivered"
                );
                self.counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(receipt) => {
                warn!(
                    batch_id = %batch.id(),
                    rejected = receipt.rejected.len(),
                    items = batch.len(),
                    "batch partially rejected"
                );
                self.counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
                for rejected in &receipt.rejected {
                    let Some(payload) = batch.item_payload(rejected.index) else {
                        error!(
                            batch_id = %batch.id(),
                            index = rejected.index,
                            "backend rejected an index outside the batch"
                        );
                        continue;
                    };
                    let reason = DeliveryError::Rejected {
                        status: rejected.status,
                    };
                    self.failover.handle(&FailedItem {
                        payload,
                        batch_id: batch.id(),
                        index: rejected.index,
                        reason: &reason,
                    });
                    self.counters.items_failed_over.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(reason) => {
                if reason == DeliveryError::Cancelled {
                    self.counters.batches_cancelled.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                }
                warn!(
                    batch_id = %batch.id(),
                    seq = batch.seq(),
                    items = batch.len(),
                    error = %reason,
                    "batch delivery failed, routing items to failover"
                );
                for (index, payload) in batch.payloads().enumerate() {
                    self.failover.handle(&FailedItem {
                        payload,
                        batch_id: batch.id(),
                        index,
                        reason: &reason,
                    });
                }
                self.counters
                    .items_failed_over
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
        }

        for buffer in batch.into_items() {
            if let Err(e) = self.pool.release(buffer) {
                error!(error = %e, "buffer release after delivery failed");
            }
        }
    }

    /// Waits out in-flight deliveries, cancelling whatever outlives the
    /// drain timeout. Returns whether the drain finished in time and how
    /// many batches had to be cancelled.
    pub(crate) async fn shutdown(&self, mut run_handle: JoinHandle<()>) -> (bool, u64) {
        self.tracker.close();
        let cancelled_before = self.counters.batches_cancelled.load(Ordering::Relaxed);

        let drained = timeout(self.config.drain_timeout, async {
            // The run loop ends once the dispatch channel closes; tracked
            // delivery tasks may still be in flight after that.
            let _ = (&mut run_handle).await;
            self.tracker.wait().await;
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                drain_timeout = ?self.config.drain_timeout,
                "in-flight deliveries exceeded the drain timeout, cancelling"
            );
            self.cancel.cancel();
            if !run_handle.is_finished() {
                // Remaining queued batches complete as cancelled.
                let _ = run_handle.await;
            }
            self.tracker.wait().await;
        } else {
            info!("dispatcher drained");
        }

        let cancelled = self.counters.batches_cancelled.load(Ordering::Relaxed) - cancelled_before;
        (drained, cancelled)
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches_delivered: self.counters.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            batches_cancelled: self.counters.batches_cancelled.load(Ordering::Relaxed),
            items_failed_over: self.counters.items_failed_over.load(Ordering::Relaxed),
        }
    }
}
