pub mod accumulator;
pub mod batch;

pub use accumulator::{AccumulatorError, BatchAccumulator, BatchConfig};
pub use batch::{Batch, SealReason};
