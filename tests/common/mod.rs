#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use logship::batch::Batch;
use logship::failover::{FailedItem, FailoverHandler};
use logship::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use tokio::sync::Notify;

pub type Outcome = Result<DeliveryReceipt, DeliveryError>;

/// Delivery channel with scripted outcomes; records every batch's payloads.
/// Once the script runs out, every delivery is accepted.
pub struct ScriptedChannel {
    outcomes: Mutex<VecDeque<Outcome>>,
    delivered: Mutex<Vec<Vec<Vec<u8>>>>,
    pub completed: Notify,
}

impl ScriptedChannel {
    pub fn accepting() -> Self {
        Self::with_outcomes(Vec::new())
    }

    pub fn with_outcomes(outcomes: Vec<Outcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            delivered: Mutex::new(Vec::new()),
            completed: Notify::new(),
        }
    }

    pub fn delivered(&self) -> Vec<Vec<Vec<u8>>> {
        self.delivered.lock().expect("lock").clone()
    }

    pub fn batches_seen(&self) -> usize {
        self.delivered.lock().expect("lock").len()
    }
}

impl DeliveryChannel for ScriptedChannel {
    fn send<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let payloads: Vec<Vec<u8>> = batch.payloads().map(<[u8]>::to_vec).collect();
            self.delivered.lock().expect("lock").push(payloads);
            let outcome = self
                .outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(DeliveryReceipt::accepted()));
            self.completed.notify_waiters();
            outcome
        })
    }
}

/// Delivery channel that parks every send until the gate opens.
pub struct GatedChannel {
    open: AtomicBool,
    gate: Notify,
    delivered: Mutex<Vec<usize>>,
}

impl GatedChannel {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            gate: Notify::new(),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
        self.gate.notify_waiters();
    }

    /// Sizes of the batches that made it through the gate.
    pub fn delivered_sizes(&self) -> Vec<usize> {
        self.delivered.lock().expect("lock").clone()
    }
}

impl DeliveryChannel for GatedChannel {
    fn send<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            loop {
                if self.open.load(Ordering::Acquire) {
                    break;
                }
                let notified = self.gate.notified();
                if self.open.load(Ordering::Acquire) {
                    break;
                }
                notified.await;
            }
            self.delivered.lock().expect("lock").push(batch.len());
            Ok(DeliveryReceipt::accepted())
        })
    }
}

/// Failover handler that records every item it is handed.
#[derive(Default)]
pub struct RecordingFailover {
    items: Mutex<Vec<FailedRecord>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub batch_id: String,
    pub index: usize,
    pub payload: Vec<u8>,
    pub reason: String,
}

impl RecordingFailover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<FailedRecord> {
        self.items.lock().expect("lock").clone()
    }

    pub fn count(&self) -> usize {
        self.items.lock().expect("lock").len()
    }
}

impl FailoverHandler for RecordingFailover {
    fn handle(&self, item: &FailedItem<'_>) {
        self.items.lock().expect("lock").push(FailedRecord {
            batch_id: item.batch_id.to_string(),
            index: item.index,
            payload: item.payload.to_vec(),
            reason: item.reason.to_string(),
        });
    }
}

/// Installs a fmt subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
