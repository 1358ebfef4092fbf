pub mod disk;
pub mod requeue;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::dispatch::DeliveryError;

pub use disk::{DiskFailover, SpillRecord, SpoolConfig, SpoolError};
pub use requeue::{RequeueConfig, RequeueFailover};

/// One item out of a failed or partially rejected batch.
#[derive(Debug)]
pub struct FailedItem<'a> {
    pub payload: &'a [u8],
    pub batch_id: &'a str,
    /// Position of the item within its batch, in append order.
    pub index: usize,
    pub reason: &'a DeliveryError,
}

/// Disposition for items whose delivery failed.
///
/// The dispatcher invokes `handle` once per failed item on its completion
/// task and releases every buffer afterwards no matter what the handler does.
/// The payload does not outlive the call; copy it if it is kept. Handlers
/// must return promptly — schedule slow work instead of blocking the
/// completion task.
pub trait FailoverHandler: Send + Sync + 'static {
    fn handle(&self, item: &FailedItem<'_>);
}

/// Default strategy: drop the item, keep count.
#[derive(Debug, Default)]
pub struct DiscardFailover {
    dropped: AtomicU64,
}

impl DiscardFailover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FailoverHandler for DiscardFailover {
    fn handle(&self, item: &FailedItem<'_>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            batch_id = item.batch_id,
            index = item.index,
            reason = %item.reason,
            "discarding undeliverable item"
        );
    }
}
