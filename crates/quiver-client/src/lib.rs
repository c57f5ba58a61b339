//! Quiver Client
//!
//! A managed consumer for NSQ. It discovers brokers through `nsqlookupd` or
//! a static address list, keeps one connection per broker, paces delivery
//! with `RDY` credit and lets downstream code acknowledge each message
//! explicitly with finish, touch or requeue.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use quiver_client::{Consumer, ConsumerConfig};
//!
//! let consumer = Consumer::new();
//! consumer.on_message(|delivery| {
//!     println!("{}", delivery.to_envelope());
//! });
//!
//! let config = ConsumerConfig::builder("events", "archive")
//!     .nsqd(vec!["127.0.0.1:4150".into()])
//!     .finish_immediately(true)
//!     .build();
//! consumer.start(config).await?;
//! ```
//!
//! # Features
//!
//! - `tls`: in-band TLS upgrade negotiated through IDENTIFY

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod registry;
pub mod resolver;
pub mod status;
#[cfg(feature = "tls")]
pub mod tls;

pub use config::{AddressSource, ConnectionConfig, ConsumerConfig, ConsumerConfigBuilder, SensitiveString};
pub use connection::{AckKind, BrokerConnection, ConnectionId, ConnectionState};
pub use consumer::{Consumer, ConsumerStatsSnapshot};
pub use error::{Error, Result};
pub use message::{AckOutcome, AckToken, Delivery, MessageHandler, Payload, ENVELOPE_TOKEN_KEY};
pub use registry::{InFlightMessage, InFlightRegistry};
pub use resolver::{AddressResolver, BrokerTarget, LookupdResolver, StaticResolver};
pub use status::{ConsumerStatus, StatusDisplay, StatusFill, StatusReporter};

pub use quiver_protocol::MessageId;
