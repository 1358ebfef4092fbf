use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::buffer::{HeapBuffer, ItemBuffer, PooledBuffer};
use super::error::PoolError;

const SLOT_FREE: u8 = 0;
const SLOT_BORROWED: u8 = 1;

/// How the pool reaches its maximum size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrowthPolicy {
    /// Preallocate every buffer up to the maximum at construction.
    Eager,
    /// Start at the configured initial size and allocate on demand.
    OnDemand,
}

/// What `release` does to a buffer's content before recycling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Length reset only; previous bytes stay in the backing storage.
    Truncate,
    /// Overwrite the written region with zeroes before truncating.
    Zero,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_buffers: usize,
    pub max_buffers: usize,
    /// Initial backing capacity of each buffer; storage grows to fit larger
    /// payloads and keeps the larger capacity across reuse.
    pub buffer_capacity: usize,
    pub growth: GrowthPolicy,
    pub reset: ResetPolicy,
    /// Upper bound on how long `borrow` waits for a release under exhaustion.
    pub borrow_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_buffers: 64,
            max_buffers: 1024,
            buffer_capacity: 8 * 1024,
            growth: GrowthPolicy::OnDemand,
            reset: ResetPolicy::Truncate,
            borrow_timeout: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.max_buffers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_buffers must be greater than 0".to_string(),
            ));
        }
        if self.initial_buffers > self.max_buffers {
            return Err(PoolError::InvalidConfig(format!(
                "initial_buffers ({}) exceeds max_buffers ({})",
                self.initial_buffers, self.max_buffers
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "buffer_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time pool accounting. `allocated == free + borrowed` holds after
/// every borrow and release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub allocated: usize,
    pub free: usize,
    pub borrowed: usize,
    pub total_borrows: u64,
    pub total_releases: u64,
    pub exhausted_events: u64,
    pub grown: u64,
}

type BufferFactory = dyn Fn(usize) -> Box<dyn ItemBuffer> + Send + Sync;

struct FreeEntry {
    slot: u32,
    storage: Box<dyn ItemBuffer>,
}

#[derive(Default)]
struct PoolCounters {
    borrows: AtomicU64,
    releases: AtomicU64,
    exhausted: AtomicU64,
    grown: AtomicU64,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    factory: Box<BufferFactory>,
    free: ArrayQueue<FreeEntry>,
    states: Box<[AtomicU8]>,
    allocated: AtomicUsize,
    borrowed: AtomicUsize,
    closed: AtomicBool,
    available: Notify,
    counters: PoolCounters,
}

impl PoolInner {
    pub(crate) fn release_storage(
        &self,
        slot: u32,
        mut storage: Box<dyn ItemBuffer>,
    ) -> Result<(), PoolError> {
        let state = self
            .states
            .get(slot as usize)
            .ok_or(PoolError::UseAfterRelease { slot })?;
        state
            .compare_exchange(SLOT_BORROWED, SLOT_FREE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PoolError::DoubleRelease { slot })?;

        match self.config.reset {
            ResetPolicy::Truncate => storage.reset(),
            ResetPolicy::Zero => storage.zero(),
        }

        self.borrowed.fetch_sub(1, Ordering::AcqRel);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);

        if self.closed.load(Ordering::Acquire) {
            // Released after shutdown: storage is freed, not recycled.
            self.allocated.fetch_sub(1, Ordering::AcqRel);
            return Ok(());
        }
        if self.free.push(FreeEntry { slot, storage }).is_err() {
            // Queue is sized to max_buffers, so this arm is unreachable in
            // correct operation.
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
        self.available.notify_one();
        Ok(())
    }
}

/// Bounded pool of reusable item buffers.
///
/// The free-list is a lock-free MPMC queue: producers borrow on arbitrary
/// application tasks while releases arrive from the dispatcher's completion
/// tasks, with no shared lock between them. Clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool of heap-backed buffers.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_factory(config, |capacity| {
            Box::new(HeapBuffer::with_capacity(capacity))
        })
    }

    /// Creates a pool over a caller-supplied backing storage.
    pub fn with_factory<F>(config: PoolConfig, factory: F) -> Result<Self, PoolError>
    where
        F: Fn(usize) -> Box<dyn ItemBuffer> + Send + Sync + 'static,
    {
        config.validate()?;

        let prealloc = match config.growth {
            GrowthPolicy::Eager => config.max_buffers,
            GrowthPolicy::OnDemand => config.initial_buffers,
        };
        let free = ArrayQueue::new(config.max_buffers);
        let states: Box<[AtomicU8]> = (0..config.max_buffers)
            .map(|_| AtomicU8::new(SLOT_FREE))
            .collect();
        for slot in 0..prealloc {
            let storage = factory(config.buffer_capacity);
            // Sized above; push cannot fail here.
            let _ = free.push(FreeEntry {
                slot: slot as u32,
                storage,
            });
        }
        debug!(
            preallocated = prealloc,
            max = config.max_buffers,
            "buffer pool initialized"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                free,
                states,
                allocated: AtomicUsize::new(prealloc),
                borrowed: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                available: Notify::new(),
                counters: PoolCounters::default(),
            }),
        })
    }

    /// Takes a free buffer without waiting, growing the pool if it is below
    /// its maximum. Fails with [`PoolError::Exhausted`] at the ceiling.
    pub fn try_borrow(&self) -> Result<PooledBuffer, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        if let Some(entry) = inner.free.pop() {
            let prev = inner.states[entry.slot as usize].swap(SLOT_BORROWED, Ordering::AcqRel);
            debug_assert_eq!(prev, SLOT_FREE, "free-list entry with non-free slot state");
            inner.borrowed.fetch_add(1, Ordering::AcqRel);
            inner.counters.borrows.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledBuffer::new(
                entry.slot,
                entry.storage,
                Arc::downgrade(inner),
            ));
        }

        loop {
            let current = inner.allocated.load(Ordering::Acquire);
            if current >= inner.config.max_buffers {
                inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted {
                    allocated: current,
                    max: inner.config.max_buffers,
                });
            }
            if inner
                .allocated
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let slot = current as u32;
                let prev = inner.states[slot as usize].swap(SLOT_BORROWED, Ordering::AcqRel);
                debug_assert_eq!(prev, SLOT_FREE, "grown slot with non-free state");
                inner.borrowed.fetch_add(1, Ordering::AcqRel);
                inner.counters.borrows.fetch_add(1, Ordering::Relaxed);
                inner.counters.grown.fetch_add(1, Ordering::Relaxed);
                let storage = (inner.factory)(inner.config.buffer_capacity);
                return Ok(PooledBuffer::new(slot, storage, Arc::downgrade(inner)));
            }
        }
    }

    /// Takes a free buffer, waiting up to the configured borrow timeout for a
    /// release when the pool is exhausted.
    pub async fn borrow(&self) -> Result<PooledBuffer, PoolError> {
        let deadline = Instant::now() + self.inner.config.borrow_timeout;
        loop {
            match self.try_borrow() {
                Err(PoolError::Exhausted { allocated, max }) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || timeout(remaining, self.inner.available.notified())
                            .await
                            .is_err()
                    {
                        return Err(PoolError::Exhausted { allocated, max });
                    }
                }
                other => return other,
            }
        }
    }

    /// Returns a borrowed buffer to the free list, resetting its content per
    /// the configured [`ResetPolicy`].
    pub fn release(&self, mut buffer: PooledBuffer) -> Result<(), PoolError> {
        let slot = buffer.slot();
        let storage = buffer
            .take_storage()
            .ok_or(PoolError::UseAfterRelease { slot })?;
        self.inner.release_storage(slot, storage)
    }

    /// Closes the pool: frees the free list and rejects further borrows.
    ///
    /// Returns the number of buffers still borrowed at the time of the call.
    /// Those are not reclaimed in place; each outstanding handle frees its
    /// storage when released or dropped.
    pub fn close(&self) -> usize {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        while let Some(entry) = inner.free.pop() {
            inner.allocated.fetch_sub(1, Ordering::AcqRel);
            drop(entry);
        }
        inner.available.notify_waiters();

        let still_borrowed = inner.borrowed.load(Ordering::Acquire);
        if still_borrowed > 0 {
            warn!(
                still_borrowed,
                "buffer pool closed with borrowed buffers outstanding"
            );
        } else {
            debug!("buffer pool closed");
        }
        still_borrowed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            allocated: inner.allocated.load(Ordering::Acquire),
            free: inner.free.len(),
            borrowed: inner.borrowed.load(Ordering::Acquire),
            total_borrows: inner.counters.borrows.load(Ordering::Relaxed),
            total_releases: inner.counters.releases.load(Ordering::Relaxed),
            exhausted_events: inner.counters.exhausted.load(Ordering::Relaxed),
            grown: inner.counters.grown.load(Ordering::Relaxed),
        }
    }
}
