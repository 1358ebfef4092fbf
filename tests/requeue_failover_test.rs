mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedChannel, wait_until};
use logship::{DeliveryError, RequeueConfig, RequeueFailover, Shipper, ShipperConfig};

fn requeue_config(max_attempts: u32) -> RequeueConfig {
    RequeueConfig {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
        state_retention: Duration::from_secs(300),
    }
}

fn single_item_batches() -> ShipperConfig {
    let mut config = ShipperConfig::default();
    config.batch.max_items = 1;
    config.batch.flush_interval_ms = 60_000;
    config
}

#[tokio::test]
async fn failed_item_is_redelivered() {
    // First delivery fails, the redelivery succeeds.
    let channel = Arc::new(ScriptedChannel::with_outcomes(vec![Err(
        DeliveryError::Transport("connection reset".to_string()),
    )]));
    let failover = Arc::new(RequeueFailover::new(requeue_config(3)));
    let shipper = Shipper::new(single_item_batches(), channel.clone(), failover.clone())
        .expect("valid config");
    failover.bind(shipper.handle());
    shipper.start().await.expect("start");

    shipper.submit(b"retry me").await.expect("submit");

    assert!(
        wait_until(Duration::from_secs(2), || channel.batches_seen() == 2).await,
        "expected the original attempt plus one redelivery, saw {}",
        channel.batches_seen()
    );
    let delivered = channel.delivered();
    assert_eq!(delivered[0], vec![b"retry me".to_vec()]);
    assert_eq!(delivered[1], vec![b"retry me".to_vec()]);

    assert!(
        wait_until(Duration::from_secs(2), || shipper.stats().pool.borrowed == 0).await
    );
    shipper.stop().await;
}

#[tokio::test]
async fn redelivery_gives_up_past_the_attempt_cap() {
    // Every delivery fails; with 2 attempts allowed the item is dropped
    // after the second redelivery is refused.
    let always_failing: Vec<_> = (0..10)
        .map(|_| Err(DeliveryError::Rejected { status: 500 }))
        .collect();
    let channel = Arc::new(ScriptedChannel::with_outcomes(always_failing));
    let failover = Arc::new(RequeueFailover::new(requeue_config(2)));
    let shipper = Shipper::new(single_item_batches(), channel.clone(), failover.clone())
        .expect("valid config");
    failover.bind(shipper.handle());
    shipper.start().await.expect("start");

    shipper.submit(b"doomed").await.expect("submit");

    // Original attempt + 2 redeliveries, then nothing more.
    assert!(wait_until(Duration::from_secs(2), || channel.batches_seen() == 3).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.batches_seen(), 3);

    assert!(
        wait_until(Duration::from_secs(2), || shipper.stats().pool.borrowed == 0).await
    );
    shipper.stop().await;
}

#[tokio::test]
async fn unbound_requeue_drops_items_without_panicking() {
    let channel = Arc::new(ScriptedChannel::with_outcomes(vec![Err(
        DeliveryError::Rejected { status: 500 },
    )]));
    let failover = Arc::new(RequeueFailover::new(requeue_config(3)));
    // Deliberately never bound.
    let shipper = Shipper::new(single_item_batches(), channel.clone(), failover)
        .expect("valid config");
    shipper.start().await.expect("start");

    shipper.submit(b"orphan").await.expect("submit");

    assert!(wait_until(Duration::from_secs(2), || channel.batches_seen() == 1).await);
    assert!(
        wait_until(Duration::from_secs(2), || shipper.stats().pool.borrowed == 0).await
    );
    shipper.stop().await;
}
