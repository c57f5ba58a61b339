//! RDY credit, backoff, touch and in-flight capacity tests
//!
//! Run with: cargo test -p quiver-integration-tests --test flow_control -- --nocapture

use anyhow::Result;
use quiver_client::{AckOutcome, Consumer, ConsumerStatus};
use quiver_integration_tests::fixtures::{MockNsqd, MockNsqdOptions};
use quiver_integration_tests::helpers::*;
use std::time::Duration;

/// RDY is the smaller of max_in_flight and the broker's max_rdy_count
#[tokio::test]
async fn test_rdy_respects_broker_cap() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start_with(MockNsqdOptions {
        max_rdy_count: 3,
        ..Default::default()
    })
    .await?;
    let consumer = Consumer::new();
    let mut config = nsqd_config("orders", "billing", &[nsqd.address()]);
    config.max_in_flight = 10;
    consumer.start(config).await?;

    wait_until(|| nsqd.last_rdy().is_some(), WAIT).await?;
    assert_eq!(nsqd.rdy_history(), vec![3]);

    consumer.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_rdy_uses_max_in_flight() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let consumer = Consumer::new();
    let mut config = nsqd_config("orders", "billing", &[nsqd.address()]);
    config.max_in_flight = 25;
    consumer.start(config).await?;

    wait_until(|| nsqd.last_rdy() == Some(25), WAIT).await?;

    consumer.stop().await;
    Ok(())
}

/// A connection with no credit left is NotReady until a message is answered
#[tokio::test]
async fn test_exhausted_credit_reports_not_ready() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    consumer
        .start(nsqd_config("orders", "billing", &[nsqd.address()]))
        .await?;
    wait_until(|| consumer.status() == ConsumerStatus::Ready(0), WAIT).await?;

    nsqd.publish("one").expect("subscribed client");
    let mut delivery = next_delivery(&mut rx).await?;
    wait_until(|| consumer.status() == ConsumerStatus::NotReady, WAIT).await?;
    assert_eq!(consumer.status().display().text, "Not Ready");

    consumer.finish(&mut delivery.token);
    wait_until(|| consumer.status() == ConsumerStatus::Ready(1), WAIT).await?;
    assert_eq!(consumer.status().display().text, "Ready (1)");

    consumer.stop().await;
    Ok(())
}

/// Requeue sends REQ with the delay in milliseconds
#[tokio::test]
async fn test_requeue_sends_req() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    consumer
        .start(nsqd_config("orders", "billing", &[nsqd.address()]))
        .await?;
    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;

    let id = nsqd.publish("retry me").expect("subscribed client");
    let mut delivery = next_delivery(&mut rx).await?;

    assert_eq!(
        consumer.requeue(&mut delivery.token, Duration::from_millis(1500), false),
        AckOutcome::Applied
    );
    assert!(delivery.token.has_responded);

    wait_until(|| nsqd.count("REQ") == 1, WAIT).await?;
    assert_eq!(
        nsqd.commands_named("REQ")[0].args,
        vec![id.to_string(), "1500".to_string()]
    );
    assert_eq!(consumer.in_flight(), 0);
    assert_eq!(consumer.stats().requeued, 1);

    consumer.stop().await;
    Ok(())
}

/// Requeue with backoff pauses delivery with RDY 0, then restores credit
#[tokio::test]
async fn test_requeue_with_backoff() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    let mut config = nsqd_config("orders", "billing", &[nsqd.address()]);
    config.max_in_flight = 2;
    consumer.start(config).await?;
    wait_until(|| nsqd.last_rdy() == Some(2), WAIT).await?;

    nsqd.publish("fails").expect("subscribed client");
    let mut delivery = next_delivery(&mut rx).await?;
    consumer.requeue(&mut delivery.token, Duration::ZERO, true);

    wait_until(|| nsqd.last_rdy() == Some(0), WAIT).await?;
    assert_eq!(nsqd.commands_named("REQ")[0].args[1], "0");

    // Backoff base is 200ms in the test config
    wait_until(|| nsqd.last_rdy() == Some(2), WAIT).await?;
    assert_eq!(nsqd.rdy_history(), vec![2, 0, 2]);

    consumer.stop().await;
    Ok(())
}

/// Touch sends TOUCH and keeps the message in flight
#[tokio::test]
async fn test_touch_keeps_message_in_flight() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start_with(MockNsqdOptions {
        msg_timeout: Duration::from_secs(10),
        ..Default::default()
    })
    .await?;
    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    consumer
        .start(nsqd_config("orders", "billing", &[nsqd.address()]))
        .await?;
    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;

    let id = nsqd.publish("slow").expect("subscribed client");
    let mut delivery = next_delivery(&mut rx).await?;
    assert_eq!(delivery.token.timeout_remaining, Duration::from_secs(10));

    tokio::time::sleep(Duration::from_millis(100)).await;
    delivery.token.timeout_remaining = Duration::ZERO;
    assert_eq!(consumer.touch(&mut delivery.token), AckOutcome::Applied);
    assert!(delivery.token.timeout_remaining > Duration::from_secs(9));
    assert!(!delivery.token.has_responded);

    wait_until(|| nsqd.count("TOUCH") == 1, WAIT).await?;
    assert_eq!(nsqd.commands_named("TOUCH")[0].args, vec![id.to_string()]);
    assert!(consumer.lookup(&delivery.token).is_some());

    assert_eq!(consumer.finish(&mut delivery.token), AckOutcome::Applied);
    wait_until(|| nsqd.count("FIN") == 1, WAIT).await?;

    consumer.stop().await;
    Ok(())
}

/// A broker that ignores RDY cannot push more than max_in_flight downstream
#[tokio::test]
async fn test_capacity_exceeded_requeues() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    consumer
        .start(nsqd_config("orders", "billing", &[nsqd.address()]))
        .await?;
    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;

    nsqd.publish("first").expect("subscribed client");
    let second = nsqd.publish("second").expect("subscribed client");

    let delivery = next_delivery(&mut rx).await?;
    assert_eq!(delivery.payload.to_value(), "first");

    wait_until(|| nsqd.count("REQ") == 1, WAIT).await?;
    assert_eq!(
        nsqd.commands_named("REQ")[0].args,
        vec![second.to_string(), "0".to_string()]
    );
    expect_no_delivery(&mut rx, Duration::from_millis(200)).await?;
    assert_eq!(consumer.in_flight(), 1);

    consumer.stop().await;
    Ok(())
}

/// E_FIN_FAILED and friends are logged, the session carries on
#[tokio::test]
async fn test_non_fatal_broker_error_keeps_session() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    consumer
        .start(nsqd_config("orders", "billing", &[nsqd.address()]))
        .await?;
    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;

    nsqd.send_error("E_FIN_FAILED FIN 0000000000000009 failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    nsqd.publish("still here").expect("subscribed client");
    let delivery = next_delivery(&mut rx).await?;
    assert_eq!(delivery.payload.to_value(), "still here");
    assert_eq!(nsqd.accepted_connections(), 1);

    consumer.stop().await;
    Ok(())
}
