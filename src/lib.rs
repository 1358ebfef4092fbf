#![warn(rust_2018_idioms)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Safe within realistic value bounds (durations, sizes)
    clippy::cast_precision_loss,      // Acceptable for jitter math
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. PoolError in pool module
    clippy::must_use_candidate        // Annotated selectively on critical APIs
)]

//! Batching engine for shipping application log events to a remote indexing
//! backend: a pool of reusable buffers, a size/time-triggered batch
//! accumulator, an asynchronous dispatcher with bounded in-flight deliveries,
//! and pluggable failover for what the backend refuses.

pub mod batch;
pub mod dispatch;
pub mod failover;
pub mod pool;
pub mod shipper;

// Re-export main types for easy access
pub use batch::{Batch, SealReason};
pub use dispatch::{
    DeliveryChannel, DeliveryError, DeliveryReceipt, HttpChannelConfig, HttpDeliveryChannel,
    RejectedItem,
};
pub use failover::{
    DiscardFailover, DiskFailover, FailedItem, FailoverHandler, RequeueConfig, RequeueFailover,
    SpoolConfig,
};
pub use pool::{
    BufferPool, GrowthPolicy, HeapBuffer, ItemBuffer, PoolConfig, PoolError, PoolStats,
    PooledBuffer, ResetPolicy,
};
pub use shipper::{
    Shipper, ShipperConfig, ShipperError, ShipperHandle, ShipperStats, ShutdownOutcome,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
