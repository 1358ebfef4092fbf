use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer pool exhausted: {allocated} allocated, maximum {max}")]
    Exhausted { allocated: usize, max: usize },

    #[error("buffer for slot {slot} released twice")]
    DoubleRelease { slot: u32 },

    #[error("buffer for slot {slot} used after release")]
    UseAfterRelease { slot: u32 },

    #[error("buffer pool is closed")]
    Closed,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Exhaustion is the one condition a producer is expected to recover
    /// from (backpressure). Everything else is a caller bug or a closed pool.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }
}
