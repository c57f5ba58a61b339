//! Consumer configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use quiver_client::{AddressSource, ConsumerConfig};
//!
//! let config = ConsumerConfig::builder("events", "archive")
//!     .address_source(AddressSource::Lookupd(vec!["127.0.0.1:4161".into()]))
//!     .max_in_flight(10)
//!     .build();
//! ```

use crate::error::{Error, Result};
use quiver_protocol::{validate_channel_name, validate_topic_name, IdentifyRequest};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

// ============================================================================
// Sensitive values
// ============================================================================

/// String that never shows up in logs or serialized output
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Empty secrets are treated as "no secret"
fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SensitiveString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(SensitiveString::new))
}

// ============================================================================
// Address source
// ============================================================================

/// A single directly addressed broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ConnectionConfig {
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    pub port: u16,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used to dial the broker
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where broker addresses come from.
///
/// Serialized as a map with exactly one of `lookupd` or `static` (alias
/// `nsqd`), e.g. `address_source: { lookupd: ["127.0.0.1:4161"] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AddressSourceMap", into = "AddressSourceMap")]
pub enum AddressSource {
    /// nsqlookupd HTTP endpoints, polled periodically
    Lookupd(Vec<String>),
    /// Fixed `host:port` broker addresses
    Static(Vec<String>),
}

impl AddressSource {
    /// Build an address source from the host-facing options.
    ///
    /// A non-empty comma separated lookupd list wins over a direct connection.
    pub fn from_options(lookupd: Option<&str>, connection: Option<&ConnectionConfig>) -> Result<Self> {
        let lookupd = lookupd.map(parse_address_list).unwrap_or_default();
        if !lookupd.is_empty() {
            return Ok(AddressSource::Lookupd(lookupd));
        }

        match connection {
            Some(connection) if !connection.host.trim().is_empty() => {
                Ok(AddressSource::Static(vec![connection.address()]))
            }
            _ => Err(Error::ConfigurationError(
                "LookupD or Connection option must be set!".to_string(),
            )),
        }
    }

    pub fn addresses(&self) -> &[String] {
        match self {
            AddressSource::Lookupd(addresses) | AddressSource::Static(addresses) => addresses,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses().iter().all(|a| a.trim().is_empty())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddressSourceMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lookupd: Option<Vec<String>>,
    #[serde(
        default,
        rename = "static",
        alias = "nsqd",
        skip_serializing_if = "Option::is_none"
    )]
    addresses: Option<Vec<String>>,
}

impl TryFrom<AddressSourceMap> for AddressSource {
    type Error = String;

    fn try_from(map: AddressSourceMap) -> std::result::Result<Self, Self::Error> {
        match (map.lookupd, map.addresses) {
            (Some(lookupd), None) => Ok(AddressSource::Lookupd(lookupd)),
            (None, Some(addresses)) => Ok(AddressSource::Static(addresses)),
            (Some(_), Some(_)) => Err("set either `lookupd` or `static`, not both".to_string()),
            (None, None) => Err("expected `lookupd` or `static` addresses".to_string()),
        }
    }
}

impl From<AddressSource> for AddressSourceMap {
    fn from(source: AddressSource) -> Self {
        match source {
            AddressSource::Lookupd(lookupd) => Self {
                lookupd: Some(lookupd),
                addresses: None,
            },
            AddressSource::Static(addresses) => Self {
                lookupd: None,
                addresses: Some(addresses),
            },
        }
    }
}

/// Split a comma separated list, trimming entries and dropping empties
pub fn parse_address_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ============================================================================
// Consumer configuration
// ============================================================================

/// Configuration for a [`Consumer`](crate::Consumer)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConsumerConfig {
    /// Topic to subscribe to
    #[validate(custom(function = "validate_topic"))]
    pub topic: String,

    /// Channel to subscribe with
    #[validate(custom(function = "validate_channel"))]
    pub channel: String,

    /// Broker discovery; `None` fails at start
    #[serde(default)]
    pub address_source: Option<AddressSource>,

    /// Maximum unacknowledged messages per broker connection
    #[serde(default = "default_max_in_flight")]
    #[validate(range(min = 1))]
    pub max_in_flight: u64,

    /// Attempts threshold (0 = unlimited). Informational only, messages
    /// above it are still delivered.
    #[serde(default)]
    pub max_attempts: u16,

    /// Acknowledge every message on receipt
    #[serde(default)]
    pub finish_immediately: bool,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub tls_insecure_skip_verify: bool,

    #[serde(default, deserialize_with = "deserialize_secret")]
    pub auth_secret: Option<SensitiveString>,

    /// Identifier stamped on every ack token; random when unset
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Requested server-side message timeout (None = broker default)
    #[serde(default, with = "humantime_serde")]
    pub msg_timeout: Option<Duration>,

    #[serde(default = "default_lookupd_poll_interval", with = "humantime_serde")]
    pub lookupd_poll_interval: Duration,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long `stop()` waits for outstanding messages
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    #[serde(default = "default_reconnect_backoff_max", with = "humantime_serde")]
    pub reconnect_backoff_max: Duration,
}

fn validate_topic(name: &str) -> std::result::Result<(), ValidationError> {
    validate_topic_name(name).map_err(|e| {
        ValidationError::new("invalid_topic").with_message(e.to_string().into())
    })
}

fn validate_channel(name: &str) -> std::result::Result<(), ValidationError> {
    validate_channel_name(name).map_err(|e| {
        ValidationError::new("invalid_channel").with_message(e.to_string().into())
    })
}

fn default_max_in_flight() -> u64 {
    1
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_client_id() -> String {
    let hostname = default_hostname();
    hostname
        .split('.')
        .next()
        .unwrap_or(hostname.as_str())
        .to_string()
}

fn default_user_agent() -> String {
    concat!("quiver/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_lookupd_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(128)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_backoff_max() -> Duration {
    Duration::from_secs(60)
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            channel: String::new(),
            address_source: None,
            max_in_flight: default_max_in_flight(),
            max_attempts: 0,
            finish_immediately: false,
            tls: false,
            tls_insecure_skip_verify: false,
            auth_secret: None,
            node_id: None,
            hostname: default_hostname(),
            client_id: default_client_id(),
            user_agent: default_user_agent(),
            heartbeat_interval: default_heartbeat_interval(),
            msg_timeout: None,
            lookupd_poll_interval: default_lookupd_poll_interval(),
            connect_timeout: default_connect_timeout(),
            drain_timeout: default_drain_timeout(),
            backoff_base: default_backoff_base(),
            max_backoff: default_max_backoff(),
            reconnect_backoff: default_reconnect_backoff(),
            reconnect_backoff_max: default_reconnect_backoff_max(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            ..Default::default()
        }
    }

    pub fn builder(topic: impl Into<String>, channel: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            config: Self::new(topic, channel),
        }
    }

    /// Check everything that must hold before any network activity and
    /// return the address source to use.
    pub fn validate_for_start(&self) -> Result<AddressSource> {
        self.validate()
            .map_err(|e| Error::ConfigurationError(e.to_string()))?;

        let source = match &self.address_source {
            Some(source) if !source.is_empty() => source.clone(),
            _ => {
                return Err(Error::ConfigurationError(
                    "LookupD or Connection option must be set!".to_string(),
                ))
            }
        };

        if self.tls && !cfg!(feature = "tls") {
            return Err(Error::ConfigurationError(
                "TLS requested but quiver-client was built without the `tls` feature".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(Error::ConfigurationError(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }

        Ok(source)
    }

    /// IDENTIFY body derived from this configuration
    pub fn identify_request(&self) -> IdentifyRequest {
        IdentifyRequest {
            client_id: self.client_id.clone(),
            hostname: self.hostname.clone(),
            user_agent: self.user_agent.clone(),
            feature_negotiation: true,
            heartbeat_interval: self.heartbeat_interval.as_millis() as i64,
            msg_timeout: self.msg_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            tls_v1: self.tls,
            ..Default::default()
        }
    }
}

/// Builder for [`ConsumerConfig`]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn address_source(mut self, source: AddressSource) -> Self {
        self.config.address_source = Some(source);
        self
    }

    /// Discover brokers through nsqlookupd
    pub fn lookupd(self, addresses: Vec<String>) -> Self {
        self.address_source(AddressSource::Lookupd(addresses))
    }

    /// Connect to fixed broker addresses
    pub fn nsqd(self, addresses: Vec<String>) -> Self {
        self.address_source(AddressSource::Static(addresses))
    }

    pub fn max_in_flight(mut self, max_in_flight: u64) -> Self {
        self.config.max_in_flight = max_in_flight;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u16) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn finish_immediately(mut self, enabled: bool) -> Self {
        self.config.finish_immediately = enabled;
        self
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        self
    }

    pub fn tls_insecure_skip_verify(mut self, enabled: bool) -> Self {
        self.config.tls_insecure_skip_verify = enabled;
        self
    }

    /// Set the AUTH secret; an empty string clears it
    pub fn auth_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.config.auth_secret = if secret.is_empty() {
            None
        } else {
            Some(SensitiveString::new(secret))
        };
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.config.node_id = Some(node_id.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn msg_timeout(mut self, timeout: Duration) -> Self {
        self.config.msg_timeout = Some(timeout);
        self
    }

    pub fn lookupd_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lookupd_poll_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set requeue backoff base and cap
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_base = base;
        self.config.max_backoff = max;
        self
    }

    /// Set reconnect backoff base and cap
    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff = base;
        self.config.reconnect_backoff_max = max;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}
