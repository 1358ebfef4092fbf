use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::dispatch::DispatchConfig;
use crate::pool::{GrowthPolicy, PoolConfig, ResetPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The configuration surface the engine consumes. Loadable from TOML; every
/// field has a default so partial files work.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShipperConfig {
    pub pool: PoolSettings,
    pub batch: BatchSettings,
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub initial_buffers: usize,
    pub max_buffers: usize,
    pub buffer_capacity_bytes: usize,
    pub growth: GrowthPolicy,
    pub reset: ResetPolicy,
    pub borrow_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            initial_buffers: defaults.initial_buffers,
            max_buffers: defaults.max_buffers,
            buffer_capacity_bytes: defaults.buffer_capacity,
            growth: defaults.growth,
            reset: defaults.reset,
            borrow_timeout_ms: defaults.borrow_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    pub max_items: usize,
    pub max_bytes: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        let defaults = BatchConfig::default();
        Self {
            max_items: defaults.max_items,
            max_bytes: defaults.max_bytes,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    pub max_in_flight: usize,
    pub drain_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let defaults = DispatchConfig::default();
        Self {
            max_in_flight: defaults.max_in_flight,
            drain_timeout_ms: defaults.drain_timeout.as_millis() as u64,
        }
    }
}

impl ShipperConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_buffers == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_buffers must be greater than 0".to_string(),
            ));
        }
        if self.pool.initial_buffers > self.pool.max_buffers {
            return Err(ConfigError::Invalid(format!(
                "pool.initial_buffers ({}) exceeds pool.max_buffers ({})",
                self.pool.initial_buffers, self.pool.max_buffers
            )));
        }
        if self.pool.buffer_capacity_bytes == 0 {
            return Err(ConfigError::Invalid(
                "pool.buffer_capacity_bytes must be greater than 0".to_string(),
            ));
        }
        if self.batch.max_items == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_items must be greater than 0".to_string(),
            ));
        }
        if self.batch.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.batch.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch.flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_in_flight must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            initial_buffers: self.pool.initial_buffers,
            max_buffers: self.pool.max_buffers,
            buffer_capacity: self.pool.buffer_capacity_bytes,
            growth: self.pool.growth,
            reset: self.pool.reset,
            borrow_timeout: Duration::from_millis(self.pool.borrow_timeout_ms),
        }
    }

    pub(crate) fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_items: self.batch.max_items,
            max_bytes: self.batch.max_bytes,
            flush_interval: Duration::from_millis(self.batch.flush_interval_ms),
        }
    }

    pub(crate) fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_in_flight: self.dispatch.max_in_flight,
            drain_timeout: Duration::from_millis(self.dispatch.drain_timeout_ms),
        }
    }
}
