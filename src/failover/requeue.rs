use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use super::{FailedItem, FailoverHandler};
use crate::shipper::ShipperHandle;

#[derive(Debug, Clone)]
pub struct RequeueConfig {
    /// Redelivery attempts per item before it is dropped.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Attempt bookkeeping idle longer than this is dropped during sweeps.
    pub state_retention: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            state_retention: Duration::from_secs(300),
        }
    }
}

const SWEEP_THRESHOLD: usize = 4096;

struct AttemptState {
    attempts: u32,
    last_seen: Instant,
}

/// Per-item attempt counter keyed by payload hash.
///
/// Re-submitted items arrive in a new batch under a new identity, so the
/// payload content is the only stable key. A hash collision can only give up
/// on an item early, never redeliver without bound.
struct AttemptTracker {
    max_attempts: u32,
    retention: Duration,
    states: Mutex<HashMap<u64, AttemptState>>,
}

impl AttemptTracker {
    fn new(max_attempts: u32, retention: Duration) -> Self {
        Self {
            max_attempts,
            retention,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Registers one more attempt for `key`. Returns the attempt number, or
    /// `None` once the cap is reached.
    fn register(&self, key: u64) -> Option<u32> {
        let mut states = self.states.lock();
        if states.len() >= SWEEP_THRESHOLD {
            let retention = self.retention;
            states.retain(|_, state| state.last_seen.elapsed() <= retention);
        }
        let state = states.entry(key).or_insert(AttemptState {
            attempts: 0,
            last_seen: Instant::now(),
        });
        state.last_seen = Instant::now();
        state.attempts += 1;
        if state.attempts > self.max_attempts {
            states.remove(&key);
            None
        } else {
            Some(state.attempts)
        }
    }
}

/// Failover strategy that re-submits failed items through the shipper with
/// capped attempts and jittered exponential backoff.
///
/// The shipper is constructed with its failover handler, so the handle binds
/// after construction: `bind` once the shipper exists. Requires a running
/// Tokio runtime — redeliveries are scheduled as delayed tasks. An item past
/// its attempt cap, or rejected by a stopped shipper, is dropped with a
/// warning.
pub struct RequeueFailover {
    shipper: OnceLock<ShipperHandle>,
    config: RequeueConfig,
    tracker: AttemptTracker,
}

impl RequeueFailover {
    pub fn new(config: RequeueConfig) -> Self {
        let tracker = AttemptTracker::new(config.max_attempts, config.state_retention);
        Self {
            shipper: OnceLock::new(),
            config,
            tracker,
        }
    }

    /// Binds the shipper redeliveries go through. Later calls are ignored.
    pub fn bind(&self, shipper: ShipperHandle) {
        let _ = self.shipper.set(shipper);
    }
}

impl FailoverHandler for RequeueFailover {
    fn handle(&self, item: &FailedItem<'_>) {
        let Some(shipper) = self.shipper.get() else {
            warn!(
                batch_id = item.batch_id,
                index = item.index,
                "requeue failover not bound to a shipper, dropping item"
            );
            return;
        };
        let key = payload_key(item.payload);
        let Some(attempt) = self.tracker.register(key) else {
            warn!(
                batch_id = item.batch_id,
                index = item.index,
                max_attempts = self.config.max_attempts,
                "redelivery attempts exhausted, dropping item"
            );
            return;
        };

        let delay = backoff_delay(&self.config, attempt);
        debug!(
            batch_id = item.batch_id,
            index = item.index,
            attempt,
            ?delay,
            "scheduling redelivery"
        );

        let payload = item.payload.to_vec();
        let shipper = shipper.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = shipper.submit(&payload).await {
                warn!(error = %e, "redelivery submit failed, dropping item");
            }
        });
    }
}

fn backoff_delay(config: &RequeueConfig, attempt: u32) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
    let delay = Duration::from_millis(base_ms.saturating_mul(multiplier));
    let capped = delay.min(config.max_delay);
    if config.jitter {
        apply_jitter(capped)
    } else {
        capped
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_factor = rng.random_range(0.5..1.5);
    let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
    Duration::from_millis(jittered_millis)
}

fn payload_key(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_without_jitter() -> RequeueConfig {
        RequeueConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            jitter: false,
            state_retention: Duration::from_secs(300),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let config = config_without_jitter();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(450));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let config = RequeueConfig {
            jitter: true,
            ..config_without_jitter()
        };
        for _ in 0..100 {
            let delay = backoff_delay(&config, 1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn tracker_gives_up_past_the_cap() {
        let tracker = AttemptTracker::new(2, Duration::from_secs(300));
        let key = payload_key(b"event");
        assert_eq!(tracker.register(key), Some(1));
        assert_eq!(tracker.register(key), Some(2));
        assert_eq!(tracker.register(key), None);
        // State was cleared; the next failure starts over.
        assert_eq!(tracker.register(key), Some(1));
    }

    #[test]
    fn tracker_keys_items_independently() {
        let tracker = AttemptTracker::new(1, Duration::from_secs(300));
        assert_eq!(tracker.register(payload_key(b"a")), Some(1));
        assert_eq!(tracker.register(payload_key(b"b")), Some(1));
        assert_eq!(tracker.register(payload_key(b"a")), None);
    }
}
