//! Test helpers and utilities

use anyhow::Result;
use quiver_client::{AddressSource, Consumer, ConsumerConfig, Delivery};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Default wait used by the scenario tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (call once at start of test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quiver_client=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll a synchronous condition until it holds
pub async fn wait_until<F>(condition: F, timeout_duration: Duration) -> Result<()>
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout_duration {
        if condition() {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }

    anyhow::bail!("Condition not met within {:?}", timeout_duration)
}

/// Assert that a future completes within the given timeout
pub async fn assert_completes_within<F, Fut, T>(future: F, duration: Duration) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    timeout(duration, future())
        .await
        .unwrap_or_else(|_| panic!("Operation did not complete within {:?}", duration))
}

/// Consumer config against static brokers with test-friendly timings
pub fn nsqd_config(topic: &str, channel: &str, nsqd: &[String]) -> ConsumerConfig {
    ConsumerConfig::builder(topic, channel)
        .address_source(AddressSource::Static(nsqd.to_vec()))
        .connect_timeout(Duration::from_secs(2))
        .drain_timeout(Duration::from_millis(500))
        .reconnect_backoff(Duration::from_millis(50), Duration::from_millis(200))
        .backoff(Duration::from_millis(200), Duration::from_secs(1))
        .build()
}

/// Route every delivery into a channel
pub fn deliveries(consumer: &Consumer) -> mpsc::UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    consumer.on_message(move |delivery| {
        let _ = tx.send(delivery);
    });
    rx
}

/// Next delivery, failing after [`WAIT`]
pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Result<Delivery> {
    match timeout(WAIT, rx.recv()).await {
        Ok(Some(delivery)) => Ok(delivery),
        Ok(None) => anyhow::bail!("Delivery channel closed"),
        Err(_) => anyhow::bail!("No delivery within {:?}", WAIT),
    }
}

/// Assert nothing is delivered for `duration`
pub async fn expect_no_delivery(
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
    duration: Duration,
) -> Result<()> {
    if let Ok(Some(delivery)) = timeout(duration, rx.recv()).await {
        anyhow::bail!("Unexpected delivery {}", delivery.token.id);
    }
    Ok(())
}
