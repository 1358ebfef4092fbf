use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use super::{FailedItem, FailoverHandler};

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("spool usage cap exceeded: {current} + {incoming} > {max} bytes")]
    CapacityExceeded {
        current: u64,
        incoming: u64,
        max: u64,
    },

    #[error("system time error: {0}")]
    SystemTime(String),
}

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub directory: PathBuf,
    pub max_usage_bytes: u64,
    /// Spill records at least this old are deleted by [`DiskFailover::sweep_expired`].
    pub retention: Duration,
    pub compression: bool,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/logship/spool"),
            max_usage_bytes: 1024 * 1024 * 1024,
            retention: Duration::from_secs(24 * 3600),
            compression: true,
        }
    }
}

/// One persisted failed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillRecord {
    pub batch_id: String,
    pub index: usize,
    /// Unix timestamp at spill time.
    pub spilled_at: u64,
    pub reason: String,
    pub payload: Vec<u8>,
}

struct SpoolState {
    current_usage: u64,
    next_seq: u64,
}

/// Failover strategy that persists failed items to a spool directory.
///
/// Each item becomes one compressed record file; a later process (or the
/// embedding application at startup) recovers them with [`read_spilled`].
/// Spilling past the usage cap drops the item with an error log rather than
/// filling the disk.
///
/// [`read_spilled`]: DiskFailover::read_spilled
pub struct DiskFailover {
    config: SpoolConfig,
    state: Mutex<SpoolState>,
}

impl DiskFailover {
    pub fn new(config: SpoolConfig) -> Result<Self, SpoolError> {
        fs::create_dir_all(&config.directory)?;
        let current_usage = scan_usage(&config.directory)?;
        Ok(Self {
            config,
            state: Mutex::new(SpoolState {
                current_usage,
                next_seq: 0,
            }),
        })
    }

    pub fn current_usage(&self) -> u64 {
        self.state.lock().current_usage
    }

    pub fn store(&self, record: &SpillRecord) -> Result<PathBuf, SpoolError> {
        let encoded = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        let data = if self.config.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(&encoded)?;
            encoder.finish()?
        } else {
            encoded
        };

        let path = {
            let mut state = self.state.lock();
            let incoming = data.len() as u64;
            if state.current_usage + incoming > self.config.max_usage_bytes {
                return Err(SpoolError::CapacityExceeded {
                    current: state.current_usage,
                    incoming,
                    max: self.config.max_usage_bytes,
                });
            }
            state.current_usage += incoming;
            let seq = state.next_seq;
            state.next_seq += 1;
            self.config.directory.join(format!(
                "{}-{:04}-{seq:08}.spill",
                record.batch_id, record.index
            ))
        };
        fs::write(&path, &data)?;
        Ok(path)
    }

    /// Reads every spill record in the directory, oldest first.
    pub fn read_spilled(&self) -> Result<Vec<SpillRecord>, SpoolError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.config.directory)? {
            let path = entry?.path();
            if !is_spill_file(&path) {
                continue;
            }
            let raw = fs::read(&path)?;
            let decoded = if self.config.compression {
                let mut decoder = GzDecoder::new(raw.as_slice());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                out
            } else {
                raw
            };
            let (record, _) =
                bincode::serde::decode_from_slice(&decoded, bincode::config::standard())?;
            records.push(record);
        }
        records.sort_by(|a: &SpillRecord, b: &SpillRecord| {
            (a.spilled_at, &a.batch_id, a.index).cmp(&(b.spilled_at, &b.batch_id, b.index))
        });
        Ok(records)
    }

    /// Deletes spill records past the retention period. Returns how many
    /// were removed.
    pub fn sweep_expired(&self) -> Result<usize, SpoolError> {
        let cutoff = unix_now()?.saturating_sub(self.config.retention.as_secs());
        let mut removed = 0;
        for entry in fs::read_dir(&self.config.directory)? {
            let entry = entry?;
            let path = entry.path();
            if !is_spill_file(&path) {
                continue;
            }
            let metadata = entry.metadata()?;
            let modified = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map_err(|e| SpoolError::SystemTime(e.to_string()))?
                .as_secs();
            if modified <= cutoff {
                let size = metadata.len();
                fs::remove_file(&path)?;
                let mut state = self.state.lock();
                state.current_usage = state.current_usage.saturating_sub(size);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired spill records");
        }
        Ok(removed)
    }
}

impl FailoverHandler for DiskFailover {
    fn handle(&self, item: &FailedItem<'_>) {
        let record = SpillRecord {
            batch_id: item.batch_id.to_string(),
            index: item.index,
            spilled_at: unix_now().unwrap_or(0),
            reason: item.reason.to_string(),
            payload: item.payload.to_vec(),
        };
        match self.store(&record) {
            Ok(path) => debug!(
                batch_id = item.batch_id,
                index = item.index,
                path = %path.display(),
                "item spilled to disk"
            ),
            Err(e) => error!(
                batch_id = item.batch_id,
                index = item.index,
                error = %e,
                "spill failed, dropping item"
            ),
        }
    }
}

fn is_spill_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "spill")
}

fn scan_usage(directory: &Path) -> Result<u64, SpoolError> {
    let mut usage = 0;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if is_spill_file(&entry.path()) {
            usage += entry.metadata()?.len();
        }
    }
    Ok(usage)
}

fn unix_now() -> Result<u64, SpoolError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| SpoolError::SystemTime(e.to_string()))
}
