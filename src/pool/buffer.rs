use std::fmt;
use std::sync::Weak;

use bytes::{BufMut, BytesMut};
use tracing::error;

use super::pool::PoolInner;

/// Backing storage for one pooled item.
///
/// A single pool serves any storage that can hold one encoded log event and
/// be reused across borrows: the default heap-backed buffer below, or an
/// embedding-specific implementation (arena slices, pooled native memory).
pub trait ItemBuffer: Send + Sync + 'static {
    /// Appends `payload` to the buffer, growing the backing storage if needed.
    fn write(&mut self, payload: &[u8]);

    /// Number of bytes written since the last reset.
    fn readable_bytes(&self) -> usize;

    /// The written bytes.
    fn as_bytes(&self) -> &[u8];

    /// Logical truncation: content length back to zero, storage retained.
    fn reset(&mut self);

    /// Overwrites the written region with zeroes, then truncates.
    fn zero(&mut self);

    /// Current backing capacity in bytes.
    fn capacity(&self) -> usize;
}

/// Default `ItemBuffer`: a growable heap buffer backed by `BytesMut`.
pub struct HeapBuffer {
    data: BytesMut,
}

impl HeapBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }
}

impl ItemBuffer for HeapBuffer {
    fn write(&mut self, payload: &[u8]) {
        self.data.put_slice(payload);
    }

    fn readable_bytes(&self) -> usize {
        self.data.len()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn reset(&mut self) {
        self.data.clear();
    }

    fn zero(&mut self) {
        self.data.fill(0);
        self.data.clear();
    }

    fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

/// A buffer borrowed from a [`BufferPool`](super::BufferPool).
///
/// Exactly one owner holds a given buffer at a time; ownership moves from the
/// producer into the batch and on to the dispatcher. Explicit release goes
/// through [`BufferPool::release`](super::BufferPool::release); a handle that
/// is dropped instead returns its storage to the pool so no error path can
/// leak a buffer.
pub struct PooledBuffer {
    slot: u32,
    storage: Option<Box<dyn ItemBuffer>>,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    pub(crate) fn new(slot: u32, storage: Box<dyn ItemBuffer>, pool: Weak<PoolInner>) -> Self {
        Self {
            slot,
            storage: Some(storage),
            pool,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn write(&mut self, payload: &[u8]) {
        self.storage_mut().write(payload);
    }

    pub fn readable_bytes(&self) -> usize {
        self.storage_ref().readable_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage_ref().as_bytes()
    }

    pub fn capacity(&self) -> usize {
        self.storage_ref().capacity()
    }

    pub(crate) fn take_storage(&mut self) -> Option<Box<dyn ItemBuffer>> {
        self.storage.take()
    }

    // Storage is present from construction until release consumes the handle.
    fn storage_ref(&self) -> &dyn ItemBuffer {
        self.storage.as_deref().expect("buffer storage present while borrowed")
    }

    fn storage_mut(&mut self) -> &mut dyn ItemBuffer {
        self.storage.as_deref_mut().expect("buffer storage present while borrowed")
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("slot", &self.slot)
            .field("len", &self.storage.as_ref().map_or(0, |s| s.readable_bytes()))
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(storage) = self.storage.take() else {
            return; // explicitly released
        };
        if let Some(pool) = self.pool.upgrade()
            && let Err(e) = pool.release_storage(self.slot, storage)
        {
            error!(slot = self.slot, error = %e, "implicit buffer release failed");
        }
        // Pool already gone: storage is freed here.
    }
}
