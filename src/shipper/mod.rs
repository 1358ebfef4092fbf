pub mod config;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batch::BatchAccumulator;
use crate::dispatch::{DeliveryChannel, DispatchStats, Dispatcher};
use crate::failover::FailoverHandler;
use crate::pool::{BufferPool, PoolError, PoolStats};

pub use config::{
    BatchSettings, ConfigError, DispatchSettings, PoolSettings, ShipperConfig,
};

const STATE_IDLE: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_STOPPED: u8 = 2;

#[derive(Error, Debug)]
pub enum ShipperError {
    /// The pool could not supply a buffer within the borrow timeout. The
    /// producer decides: retry later, or drop the event.
    #[error("buffer pool exhausted, apply backpressure and retry")]
    Backpressure,

    #[error("payload of {size} bytes exceeds the {limit}-byte ceiling")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("shipper is not running")]
    Stopped,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pool(PoolError),
}

/// Result of [`Shipper::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight delivery finished within the drain timeout.
    Clean,
    /// The drain timeout elapsed; the given number of batches were cancelled
    /// and their items routed through the failover handler.
    TimedOut { cancelled_batches: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShipperStats {
    pub submitted: u64,
    pub pool: PoolStats,
    pub dispatch: DispatchStats,
}

/// Producer-side handle; clones share the same engine.
pub type ShipperHandle = Shipper;

struct Running {
    pool: BufferPool,
    accumulator: BatchAccumulator,
    dispatcher: Arc<Dispatcher>,
    run_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

struct ShipperInner {
    config: ShipperConfig,
    channel: Arc<dyn DeliveryChannel>,
    failover: Arc<dyn FailoverHandler>,
    state: AtomicU8,
    running: RwLock<Option<Arc<Running>>>,
    submitted: AtomicU64,
}

/// The batching engine: pool, accumulator, and dispatcher behind one
/// start/stop lifecycle.
///
/// Producers call [`submit`] from any task; the engine borrows a pooled
/// buffer, copies the payload in, and batches it. Delivery and failover run
/// off the producer's path. [`stop`] drains: the open batch is sealed and
/// delivered, in-flight batches get the drain grace period, and the pool is
/// closed with nothing left borrowed.
///
/// [`submit`]: Shipper::submit
/// [`stop`]: Shipper::stop
#[derive(Clone)]
pub struct Shipper {
    inner: Arc<ShipperInner>,
}

impl Shipper {
    pub fn new(
        config: ShipperConfig,
        channel: Arc<dyn DeliveryChannel>,
        failover: Arc<dyn FailoverHandler>,
    ) -> Result<Self, ShipperError> {
        config
            .validate()
            .map_err(|e| ShipperError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(ShipperInner {
                config,
                channel,
                failover,
                state: AtomicU8::new(STATE_IDLE),
                running: RwLock::new(None),
                submitted: AtomicU64::new(0),
            }),
        })
    }

    pub fn handle(&self) -> ShipperHandle {
        self.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_STARTED
    }

    /// Initializes the pool per its growth policy and starts the dispatch
    /// loop. A no-op while already started; a stopped shipper does not
    /// restart.
    pub async fn start(&self) -> Result<(), ShipperError> {
        match self.inner.state.compare_exchange(
            STATE_IDLE,
            STATE_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_STARTED) => return Ok(()),
            Err(_) => return Err(ShipperError::Stopped),
        }

        let pool = BufferPool::new(self.inner.config.pool_config()).map_err(ShipperError::Pool)?;
        let dispatch_config = self.inner.config.dispatch_config();
        // Sealed batches queue here when the in-flight window is full,
        // backpressuring the sealer.
        let (dispatch_tx, dispatch_rx) = mpsc::channel(dispatch_config.max_in_flight * 2);
        let accumulator = BatchAccumulator::new(self.inner.config.batch_config(), dispatch_tx);
        let dispatcher = Dispatcher::new(
            pool.clone(),
            Arc::clone(&self.inner.channel),
            Arc::clone(&self.inner.failover),
            dispatch_config,
        );
        let run_handle = dispatcher.spawn_run(dispatch_rx);

        *self.inner.running.write() = Some(Arc::new(Running {
            pool,
            accumulator,
            dispatcher,
            run_handle: AsyncMutex::new(Some(run_handle)),
        }));
        info!(
            pool_max = self.inner.config.pool.max_buffers,
            batch_max_items = self.inner.config.batch.max_items,
            flush_interval_ms = self.inner.config.batch.flush_interval_ms,
            max_in_flight = self.inner.config.dispatch.max_in_flight,
            "shipper started"
        );
        Ok(())
    }

    /// Accepts one encoded log event.
    ///
    /// Borrows a pooled buffer, writes the payload, and appends it to the
    /// open batch. Under pool exhaustion this waits up to the borrow timeout
    /// and then reports [`ShipperError::Backpressure`].
    pub async fn submit(&self, payload: &[u8]) -> Result<(), ShipperError> {
        if self.inner.state.load(Ordering::Acquire) != STATE_STARTED {
            return Err(ShipperError::Stopped);
        }
        let running = self
            .inner
            .running
            .read()
            .clone()
            .ok_or(ShipperError::Stopped)?;

        let limit = self.inner.config.batch.max_bytes;
        if payload.len() > limit {
            return Err(ShipperError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let mut buffer = running.pool.borrow().await.map_err(|e| match e {
            PoolError::Exhausted { .. } => ShipperError::Backpressure,
            PoolError::Closed => ShipperError::Stopped,
            other => ShipperError::Pool(other),
        })?;
        buffer.write(payload);
        running
            .accumulator
            .append(buffer)
            .await
            .map_err(|_| ShipperError::Stopped)?;
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drains and shuts the engine down. Idempotent.
    ///
    /// Order: flush timers stop, the open batch is sealed and handed off,
    /// the dispatch channel closes, in-flight deliveries get the drain
    /// timeout, stragglers are cancelled into failover, and the pool closes.
    pub async fn stop(&self) -> ShutdownOutcome {
        match self.inner.state.compare_exchange(
            STATE_STARTED,
            STATE_STOPPED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_IDLE) => {
                let _ = self.inner.state.compare_exchange(
                    STATE_IDLE,
                    STATE_STOPPED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return ShutdownOutcome::Clean;
            }
            Err(_) => return ShutdownOutcome::Clean,
        }
        let Some(running) = self.inner.running.read().clone() else {
            return ShutdownOutcome::Clean;
        };

        info!("stopping shipper, draining buffered items");
        running.accumulator.close().await;

        let run_handle = running.run_handle.lock().await.take();
        let (drained, cancelled_batches) = match run_handle {
            Some(handle) => running.dispatcher.shutdown(handle).await,
            None => (true, 0),
        };

        let still_borrowed = running.pool.close();
        if still_borrowed > 0 {
            warn!(still_borrowed, "buffers remained borrowed after drain");
        }

        let outcome = if drained {
            ShutdownOutcome::Clean
        } else {
            ShutdownOutcome::TimedOut { cancelled_batches }
        };
        info!(?outcome, "shipper stopped");
        outcome
    }

    pub fn stats(&self) -> ShipperStats {
        let running = self.inner.running.read().clone();
        let (pool, dispatch) = running.map_or_else(
            || (PoolStats::default(), DispatchStats::default()),
            |r| (r.pool.stats(), r.dispatcher.stats()),
        );
        ShipperStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            pool,
            dispatch,
        }
    }
}
