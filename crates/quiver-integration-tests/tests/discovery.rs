//! nsqlookupd discovery tests
//!
//! Run with: cargo test -p quiver-integration-tests --test discovery -- --nocapture

use anyhow::Result;
use quiver_client::resolver::{AddressResolver, LookupdResolver};
use quiver_client::{AckOutcome, AddressSource, BrokerTarget, Consumer, ConsumerConfig, ConsumerStatus};
use quiver_integration_tests::fixtures::{MockLookupd, MockNsqd};
use quiver_integration_tests::helpers::*;
use std::time::Duration;
use tracing::info;

fn lookupd_config(topic: &str, lookupd: &MockLookupd) -> ConsumerConfig {
    let mut config = nsqd_config(topic, "billing", &[]);
    config.address_source = Some(AddressSource::Lookupd(vec![lookupd.address()]));
    config.lookupd_poll_interval = Duration::from_millis(100);
    config
}

#[tokio::test]
async fn test_resolver_bare_and_wrapped_responses() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    for lookupd in [MockLookupd::start().await?, MockLookupd::start_wrapped().await?] {
        lookupd.register("orders", nsqd.addr);

        let resolver = LookupdResolver::new(
            vec![lookupd.address()],
            "orders",
            Duration::from_secs(60),
            Duration::from_secs(2),
        )?;
        let targets = resolver.resolve().await?;
        assert_eq!(
            targets.into_iter().collect::<Vec<_>>(),
            vec![BrokerTarget::new(nsqd.address())]
        );
        assert_eq!(lookupd.requests(), 1);
    }
    Ok(())
}

/// Unknown topics resolve to nothing rather than failing
#[tokio::test]
async fn test_resolver_topic_not_found() -> Result<()> {
    init_tracing();

    let lookupd = MockLookupd::start().await?;
    let resolver = LookupdResolver::new(
        vec![lookupd.address()],
        "missing",
        Duration::from_secs(60),
        Duration::from_secs(2),
    )?;
    assert!(resolver.resolve().await?.is_empty());
    Ok(())
}

/// One reachable endpoint is enough
#[tokio::test]
async fn test_resolver_tolerates_partial_failure() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;
    lookupd.register("orders", nsqd.addr);

    let resolver = LookupdResolver::new(
        vec!["127.0.0.1:1".to_string(), lookupd.address()],
        "orders",
        Duration::from_secs(60),
        Duration::from_secs(2),
    )?;
    assert_eq!(resolver.resolve().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_consume_via_lookupd() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;
    lookupd.register("orders", nsqd.addr);

    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    consumer.start(lookupd_config("orders", &lookupd)).await?;

    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;
    assert_eq!(
        nsqd.commands_named("SUB")[0].args,
        vec!["orders".to_string(), "billing".to_string()]
    );

    nsqd.publish(r#"{"id":1}"#).expect("subscribed client");
    let mut delivery = next_delivery(&mut rx).await?;
    assert_eq!(consumer.finish(&mut delivery.token), AckOutcome::Applied);
    wait_until(|| nsqd.count("FIN") == 1, WAIT).await?;

    // Polling keeps the existing connection
    wait_until(|| lookupd.requests() >= 3, WAIT).await?;
    assert_eq!(nsqd.accepted_connections(), 1);

    consumer.stop().await;
    Ok(())
}

/// A topic that appears later is picked up by the next poll
#[tokio::test]
async fn test_late_producer_is_discovered() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;

    let consumer = Consumer::new();
    consumer.start(lookupd_config("orders", &lookupd)).await?;

    wait_until(|| lookupd.requests() >= 2, WAIT).await?;
    assert_eq!(nsqd.accepted_connections(), 0);
    assert_eq!(consumer.status(), ConsumerStatus::NotReady);

    lookupd.register("orders", nsqd.addr);
    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;
    wait_until(|| consumer.status().is_ready(), WAIT).await?;

    consumer.stop().await;
    Ok(())
}

/// Each resolved broker gets its own connection
#[tokio::test]
async fn test_multiple_producers() -> Result<()> {
    init_tracing();

    let first = MockNsqd::start().await?;
    let second = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;
    lookupd.register("orders", first.addr);
    lookupd.register("orders", second.addr);

    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    let mut config = lookupd_config("orders", &lookupd);
    config.max_in_flight = 4;
    consumer.start(config).await?;

    wait_until(
        || first.subscribed_clients() == 1 && second.subscribed_clients() == 1,
        WAIT,
    )
    .await?;
    assert_eq!(first.last_rdy(), Some(4));
    assert_eq!(second.last_rdy(), Some(4));
    assert_eq!(consumer.stats().connections, 2);

    first.publish("from first").expect("subscribed client");
    second.publish("from second").expect("subscribed client");
    let mut a = next_delivery(&mut rx).await?;
    let mut b = next_delivery(&mut rx).await?;
    assert_ne!(a.token.connection, b.token.connection);

    assert!(consumer.finish(&mut a.token).is_applied());
    assert!(consumer.finish(&mut b.token).is_applied());
    wait_until(|| first.count("FIN") == 1 && second.count("FIN") == 1, WAIT).await?;

    consumer.stop().await;
    Ok(())
}

/// A broker that disappears from lookup is closed and not reconnected
#[tokio::test]
async fn test_removed_producer_is_closed() -> Result<()> {
    init_tracing();

    let first = MockNsqd::start().await?;
    let second = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;
    lookupd.register("orders", first.addr);
    lookupd.register("orders", second.addr);

    let consumer = Consumer::new();
    consumer.start(lookupd_config("orders", &lookupd)).await?;
    wait_until(
        || first.subscribed_clients() == 1 && second.subscribed_clients() == 1,
        WAIT,
    )
    .await?;

    lookupd.unregister("orders", second.addr);
    wait_until(|| second.count("CLS") == 1, WAIT).await?;
    wait_until(|| consumer.stats().connections == 1, WAIT).await?;
    info!("Second broker closed after leaving lookup");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(second.accepted_connections(), 1);
    assert_eq!(first.count("CLS"), 0);

    consumer.stop().await;
    Ok(())
}

/// A broker that leaves lookup and comes back while its old connection is
/// still draining gets a fresh connection once the drain ends
#[tokio::test]
async fn test_producer_back_during_drain_is_reopened() -> Result<()> {
    init_tracing();

    let nsqd = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;
    lookupd.register("orders", nsqd.addr);

    let consumer = Consumer::new();
    let mut rx = deliveries(&consumer);
    let mut config = lookupd_config("orders", &lookupd);
    config.lookupd_poll_interval = Duration::from_secs(1);
    config.drain_timeout = Duration::from_secs(5);
    consumer.start(config).await?;
    wait_until(|| nsqd.subscribed_clients() == 1, WAIT).await?;

    // A held message keeps the closing connection draining
    nsqd.publish("held").expect("subscribed client");
    let mut held = next_delivery(&mut rx).await?;

    lookupd.unregister("orders", nsqd.addr);
    wait_until(|| nsqd.last_rdy() == Some(0), WAIT).await?;
    lookupd.register("orders", nsqd.addr);

    // The next poll resolves the broker while the old connection drains
    let seen = lookupd.requests();
    wait_until(|| lookupd.requests() > seen, WAIT).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(nsqd.accepted_connections(), 1);

    assert_eq!(consumer.finish(&mut held.token), AckOutcome::Applied);
    wait_until(|| nsqd.count("CLS") == 1, WAIT).await?;

    // Reopened right away rather than on the next poll
    wait_until(
        || nsqd.accepted_connections() == 2 && nsqd.subscribed_clients() == 1,
        Duration::from_millis(700),
    )
    .await?;
    assert_eq!(consumer.stats().connections, 1);

    consumer.stop().await;
    Ok(())
}

/// Every lookupd down and nothing connected shows up as an error
#[tokio::test]
async fn test_lookupd_unavailable_reports_error() -> Result<()> {
    init_tracing();

    let consumer = Consumer::new();
    let mut config = nsqd_config("orders", "billing", &[]);
    config.address_source = Some(AddressSource::Lookupd(vec!["127.0.0.1:1".to_string()]));
    consumer.start(config).await?;

    wait_until(
        || matches!(consumer.status(), ConsumerStatus::ConnectionError(_)),
        WAIT,
    )
    .await?;

    consumer.stop().await;
    Ok(())
}
