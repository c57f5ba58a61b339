//! Quiver CLI - consume NSQ topics from the command line
//!
//! Every delivery is printed as one JSON envelope per line on stdout, then
//! acknowledged according to `--ack`.

use clap::{Parser, Subcommand, ValueEnum};
use quiver_client::resolver::{lookup_url, AddressResolver, LookupdResolver};
use quiver_client::{
    config::parse_address_list, AckOutcome, AddressSource, Consumer, ConsumerConfig, Delivery,
    SensitiveString,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "quiver")]
#[command(about = "Quiver - managed NSQ consumer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AckMode {
    /// Finish every message after printing it
    Finish,
    /// Requeue every message after printing it
    Requeue,
    /// Finish on receipt, before printing
    Auto,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume a topic and print deliveries as JSON lines
    Consume {
        /// Topic name
        #[arg(short, long)]
        topic: Option<String>,

        /// Channel name
        #[arg(short, long)]
        channel: Option<String>,

        /// YAML consumer configuration; flags override its values
        #[arg(short = 'f', long)]
        config: Option<PathBuf>,

        /// Comma separated nsqlookupd HTTP addresses
        #[arg(long, env = "QUIVER_LOOKUPD")]
        lookupd: Option<String>,

        /// Comma separated nsqd TCP addresses
        #[arg(long, env = "QUIVER_NSQD", conflicts_with = "lookupd")]
        nsqd: Option<String>,

        /// Maximum in-flight messages per broker
        #[arg(short, long)]
        max_in_flight: Option<u64>,

        /// Attempts threshold logged for redelivered messages (0 = unlimited)
        #[arg(long)]
        max_attempts: Option<u16>,

        #[arg(long, value_enum, default_value = "finish")]
        ack: AckMode,

        /// With `--ack finish`, requeue messages whose body is not JSON
        #[arg(long)]
        requeue_on_error: bool,

        /// Requeue delay used with `--ack requeue`
        #[arg(long, default_value = "0s", value_parser = parse_duration)]
        requeue_delay: Duration,

        /// Exit after this many messages
        #[arg(short = 'n', long)]
        max_messages: Option<u64>,

        /// Negotiate TLS with the broker
        #[arg(long)]
        tls: bool,

        #[arg(long, env = "QUIVER_AUTH_SECRET", hide_env_values = true)]
        auth_secret: Option<String>,
    },

    /// Resolve the brokers producing a topic through nsqlookupd
    Lookup {
        /// Topic name
        topic: String,

        /// Comma separated nsqlookupd HTTP addresses
        #[arg(long, env = "QUIVER_LOOKUPD", default_value = "127.0.0.1:4161")]
        lookupd: String,

        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        timeout: Duration,
    },
}

struct ConsumeArgs {
    topic: Option<String>,
    channel: Option<String>,
    config: Option<PathBuf>,
    lookupd: Option<String>,
    nsqd: Option<String>,
    max_in_flight: Option<u64>,
    max_attempts: Option<u16>,
    ack: AckMode,
    tls: bool,
    auth_secret: Option<String>,
}

fn load_config(args: ConsumeArgs) -> anyhow::Result<ConsumerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<ConsumerConfig>(&raw)?
        }
        None => ConsumerConfig::default(),
    };

    if let Some(topic) = args.topic {
        config.topic = topic;
    }
    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(lookupd) = args.lookupd {
        config.address_source = Some(AddressSource::Lookupd(parse_address_list(&lookupd)));
    }
    if let Some(nsqd) = args.nsqd {
        config.address_source = Some(AddressSource::Static(parse_address_list(&nsqd)));
    }
    if let Some(max_in_flight) = args.max_in_flight {
        config.max_in_flight = max_in_flight;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if matches!(args.ack, AckMode::Auto) {
        config.finish_immediately = true;
    }
    if args.tls {
        config.tls = true;
    }
    if let Some(secret) = args.auth_secret.filter(|s| !s.is_empty()) {
        config.auth_secret = Some(SensitiveString::new(secret));
    }
    Ok(config)
}

struct AckPolicy {
    mode: AckMode,
    requeue_delay: Duration,
    requeue_on_error: bool,
}

async fn consume(
    config: ConsumerConfig,
    policy: AckPolicy,
    max_messages: Option<u64>,
) -> anyhow::Result<()> {
    let consumer = Consumer::new();
    let (tx, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
    consumer.on_message(move |delivery| {
        let _ = tx.send(delivery);
    });

    let mut status = consumer.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!(status = %current, "Consumer status changed");
        }
    });

    consumer.start(config).await?;

    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping consumer");
                break;
            }
            delivery = deliveries.recv() => {
                let Some(mut delivery) = delivery else { break };
                println!("{}", serde_json::to_string(&delivery.to_envelope())?);

                let failed = policy.requeue_on_error && !delivery.payload.is_json();
                let outcome = match policy.mode {
                    AckMode::Auto => AckOutcome::Applied,
                    AckMode::Finish if !failed => consumer.finish(&mut delivery.token),
                    AckMode::Finish | AckMode::Requeue => {
                        consumer.requeue(&mut delivery.token, policy.requeue_delay, false)
                    }
                };
                if !outcome.is_applied() {
                    warn!(message_id = %delivery.token.id, "Acknowledgment was not applied");
                }

                received += 1;
                if max_messages.is_some_and(|max| received >= max) {
                    break;
                }
            }
        }
    }

    consumer.stop().await;
    let stats = consumer.stats();
    info!(
        delivered = stats.delivered,
        finished = stats.finished,
        requeued = stats.requeued,
        "Consumer finished"
    );
    Ok(())
}

async fn lookup(topic: String, lookupd: String, timeout: Duration) -> anyhow::Result<()> {
    let endpoints = parse_address_list(&lookupd);
    for endpoint in &endpoints {
        info!(url = %lookup_url(endpoint), "Querying nsqlookupd");
    }

    let resolver = LookupdResolver::new(endpoints, topic.clone(), Duration::ZERO, timeout)?;
    let targets = resolver.resolve().await?;

    if targets.is_empty() {
        println!("No producers for topic '{}'", topic);
    } else {
        println!("Producers for topic '{}':", topic);
        for target in targets {
            println!("  • {}", target);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, deliveries to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Consume {
            topic,
            channel,
            config,
            lookupd,
            nsqd,
            max_in_flight,
            max_attempts,
            ack,
            requeue_on_error,
            requeue_delay,
            max_messages,
            tls,
            auth_secret,
        } => {
            let config = load_config(ConsumeArgs {
                topic,
                channel,
                config,
                lookupd,
                nsqd,
                max_in_flight,
                max_attempts,
                ack,
                tls,
                auth_secret,
            })?;
            let policy = AckPolicy {
                mode: ack,
                requeue_delay,
                requeue_on_error,
            };
            consume(config, policy, max_messages).await?;
        }

        Commands::Lookup {
            topic,
            lookupd,
            timeout,
        } => lookup(topic, lookupd, timeout).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ConsumeArgs {
        ConsumeArgs {
            topic: Some("orders".into()),
            channel: Some("billing".into()),
            config: None,
            lookupd: None,
            nsqd: None,
            max_in_flight: None,
            max_attempts: None,
            ack: AckMode::Finish,
            tls: false,
            auth_secret: None,
        }
    }

    #[test]
    fn test_flags_build_config() {
        let config = load_config(ConsumeArgs {
            nsqd: Some("127.0.0.1:4150, 127.0.0.2:4150".into()),
            max_in_flight: Some(8),
            max_attempts: Some(5),
            ack: AckMode::Auto,
            auth_secret: Some(String::new()),
            ..args()
        })
        .unwrap();

        assert_eq!(config.topic, "orders");
        assert_eq!(
            config.address_source,
            Some(AddressSource::Static(vec![
                "127.0.0.1:4150".into(),
                "127.0.0.2:4150".into()
            ]))
        );
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.max_attempts, 5);
        assert!(config.finish_immediately);
        assert!(config.auth_secret.is_none());
    }

    #[test]
    fn test_yaml_file_with_flag_overrides() {
        let path = std::env::temp_dir().join(format!("quiver-cli-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            r#"
topic: events
channel: archive
address_source:
  lookupd: ["127.0.0.1:4161", "127.0.0.2:4161"]
max_in_flight: 25
lookupd_poll_interval: 15s
"#,
        )
        .unwrap();

        let config = load_config(ConsumeArgs {
            topic: None,
            channel: Some("replay".into()),
            config: Some(path.clone()),
            ..args()
        });
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();

        assert_eq!(config.topic, "events");
        assert_eq!(config.channel, "replay");
        assert_eq!(config.max_in_flight, 25);
        assert_eq!(config.lookupd_poll_interval, Duration::from_secs(15));
        assert_eq!(
            config.address_source,
            Some(AddressSource::Lookupd(vec![
                "127.0.0.1:4161".into(),
                "127.0.0.2:4161".into()
            ]))
        );
        assert!(config.validate_for_start().is_ok());
    }

    #[test]
    fn test_missing_source_fails_at_start() {
        let config = load_config(args()).unwrap();
        assert!(config.address_source.is_none());
        assert!(config.validate_for_start().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1500ms"), Ok(Duration::from_millis(1500)));
        assert!(parse_duration("soon").is_err());
    }
}
