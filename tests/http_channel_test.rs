mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RecordingFailover, init_tracing, wait_until};
use logship::{
    DiscardFailover, HttpChannelConfig, HttpDeliveryChannel, Shipper, ShipperConfig,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn channel_for(server: &MockServer, enable_compression: bool) -> HttpDeliveryChannel {
    HttpDeliveryChannel::new(HttpChannelConfig {
        endpoint: format!("{}/_bulk", server.uri()),
        enable_compression,
        compress_min_bytes: 1,
        ..HttpChannelConfig::default()
    })
    .expect("valid channel config")
}

fn three_item_batches() -> ShipperConfig {
    let mut config = ShipperConfig::default();
    config.batch.max_items = 3;
    config.batch.flush_interval_ms = 60_000;
    config
}

#[tokio::test]
async fn accepted_batch_posts_newline_delimited_payloads() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let channel = Arc::new(channel_for(&server, false));
    let shipper = Shipper::new(
        three_item_batches(),
        channel,
        Arc::new(DiscardFailover::new()),
    )
    .expect("valid config");
    shipper.start().await.expect("start");

    for payload in [br#"{"msg":"a"}"# as &[u8], br#"{"msg":"b"}"#, br#"{"msg":"c"}"#] {
        shipper.submit(payload).await.expect("submit");
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            shipper.stats().dispatch.batches_delivered == 1
        })
        .await
    );

    let requests = server.received_requests().await.expect("recorded requests");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(
        request.body,
        b"{\"msg\":\"a\"}\n{\"msg\":\"b\"}\n{\"msg\":\"c\"}\n"
    );
    assert_eq!(
        request
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/x-ndjson")
    );
    assert_eq!(
        request
            .headers
            .get("x-batch-size")
            .and_then(|v| v.to_str().ok()),
        Some("3")
    );
    assert!(request.headers.get("x-batch-id").is_some());

    shipper.stop().await;
    assert_eq!(shipper.stats().pool.borrowed, 0);
}

#[tokio::test]
async fn large_bodies_arrive_gzip_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let channel = Arc::new(channel_for(&server, true));
    let mut config = three_item_batches();
    config.batch.max_items = 1;
    let shipper = Shipper::new(config, channel, Arc::new(DiscardFailover::new()))
        .expect("valid config");
    shipper.start().await.expect("start");

    shipper.submit(b"compress this payload").await.expect("submit");

    assert!(
        wait_until(Duration::from_secs(5), || {
            shipper.stats().dispatch.batches_delivered == 1
        })
        .await
    );

    let requests = server.received_requests().await.expect("recorded requests");
    let request = &requests[0];
    assert_eq!(
        request
            .headers
            .get("content-encoding")
            .and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
    assert_eq!(&request.body[..2], &[0x1f, 0x8b]);

    shipper.stop().await;
}

#[tokio::test]
async fn server_errors_fail_the_batch_into_failover() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let channel = Arc::new(channel_for(&server, false));
    let failover = Arc::new(RecordingFailover::new());
    let shipper = Shipper::new(three_item_batches(), channel, failover.clone())
        .expect("valid config");
    shipper.start().await.expect("start");

    for payload in [b"x" as &[u8], b"y", b"z"] {
        shipper.submit(payload).await.expect("submit");
    }

    assert!(wait_until(Duration::from_secs(5), || failover.count() == 3).await);
    assert!(failover.items().iter().all(|item| item.reason.contains("503")));
    assert!(
        wait_until(Duration::from_secs(2), || shipper.stats().pool.borrowed == 0).await
    );
    shipper.stop().await;
}

#[tokio::test]
async fn per_item_rejections_fail_over_selectively() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [{"status": 200}, {"status": 429}, {"status": 200}],
        })))
        .mount(&server)
        .await;

    let channel = Arc::new(channel_for(&server, false));
    let failover = Arc::new(RecordingFailover::new());
    let shipper = Shipper::new(three_item_batches(), channel, failover.clone())
        .expect("valid config");
    shipper.start().await.expect("start");

    for payload in [b"ok-1" as &[u8], b"throttled", b"ok-2"] {
        shipper.submit(payload).await.expect("submit");
    }

    assert!(wait_until(Duration::from_secs(5), || failover.count() == 1).await);
    let items = failover.items();
    assert_eq!(items[0].index, 1);
    assert_eq!(items[0].payload, b"throttled");
    assert!(items[0].reason.contains("429"));

    shipper.stop().await;
    assert_eq!(shipper.stats().pool.borrowed, 0);
}
