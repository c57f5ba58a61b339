//! Broker discovery
//!
//! An [`AddressResolver`] turns the configured address source into the set
//! of nsqd TCP addresses to hold connections to. Static lists resolve once;
//! nsqlookupd endpoints are polled by the coordinator.

use crate::config::{AddressSource, ConsumerConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// nsqd TCP endpoint (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerTarget(String);

impl BrokerTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    /// Host part, used as the TLS server name
    pub fn host(&self) -> &str {
        let host = self
            .0
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.0);
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of broker targets
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Current target set. Fails with [`Error::DiscoveryUnavailable`] when
    /// no source could be reached.
    async fn resolve(&self) -> Result<BTreeSet<BrokerTarget>>;

    /// How often [`resolve`](Self::resolve) should be re-run (`None` = once)
    fn poll_interval(&self) -> Option<Duration>;
}

/// Build the resolver for a validated address source
pub fn resolver_for(source: &AddressSource, config: &ConsumerConfig) -> Result<Arc<dyn AddressResolver>> {
    Ok(match source {
        AddressSource::Static(addresses) => Arc::new(StaticResolver::new(addresses.clone())),
        AddressSource::Lookupd(endpoints) => Arc::new(LookupdResolver::new(
            endpoints.clone(),
            &config.topic,
            config.lookupd_poll_interval,
            config.connect_timeout,
        )?),
    })
}

// ============================================================================
// Static
// ============================================================================

/// Fixed broker list
#[derive(Debug, Clone)]
pub struct StaticResolver {
    targets: BTreeSet<BrokerTarget>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            targets: addresses
                .into_iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .map(BrokerTarget::new)
                .collect(),
        }
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self) -> Result<BTreeSet<BrokerTarget>> {
        Ok(self.targets.clone())
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

// ============================================================================
// nsqlookupd
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Older nsqlookupd versions wrap the payload
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Wrapped {
        #[allow(dead_code)]
        status_code: u16,
        data: LookupData,
    },
    Bare(LookupData),
}

/// Extract broker targets from a `/lookup` response body
pub fn parse_lookup_response(body: &[u8]) -> Result<Vec<BrokerTarget>> {
    let response: LookupResponse = serde_json::from_slice(body)
        .map_err(|e| Error::DiscoveryUnavailable(format!("invalid lookup response: {}", e)))?;

    let data = match response {
        LookupResponse::Wrapped { data, .. } => data,
        LookupResponse::Bare(data) => data,
    };

    Ok(data
        .producers
        .into_iter()
        .map(|p| BrokerTarget::new(format!("{}:{}", p.broadcast_address, p.tcp_port)))
        .collect())
}

/// `/lookup` URL for an endpoint given as `host:port` or a full URL
pub fn lookup_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    if base.ends_with("/lookup") {
        base
    } else {
        format!("{}/lookup", base)
    }
}

/// Queries every nsqlookupd endpoint concurrently; the union of successful
/// answers is the target set.
#[derive(Debug, Clone)]
pub struct LookupdResolver {
    client: reqwest::Client,
    urls: Vec<String>,
    topic: String,
    poll_interval: Duration,
}

impl LookupdResolver {
    pub fn new(
        endpoints: Vec<String>,
        topic: impl Into<String>,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::ConfigurationError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            urls: endpoints
                .iter()
                .filter(|e| !e.trim().is_empty())
                .map(|e| lookup_url(e))
                .collect(),
            topic: topic.into(),
            poll_interval,
        })
    }

    async fn query(&self, url: &str) -> Result<Vec<BrokerTarget>> {
        let response = self
            .client
            .get(url)
            .query(&[("topic", self.topic.as_str())])
            .send()
            .await
            .map_err(|e| Error::DiscoveryUnavailable(format!("{}: {}", url, e)))?;

        // Topic not registered yet: nothing to connect to, not a failure
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(url = %url, topic = %self.topic, "Topic not found");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::DiscoveryUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::DiscoveryUnavailable(format!("{}: {}", url, e)))?;
        parse_lookup_response(&body)
    }
}

#[async_trait]
impl AddressResolver for LookupdResolver {
    async fn resolve(&self) -> Result<BTreeSet<BrokerTarget>> {
        let results = join_all(self.urls.iter().map(|url| self.query(url))).await;

        let mut targets = BTreeSet::new();
        let mut failures = Vec::new();
        for (url, result) in self.urls.iter().zip(results) {
            match result {
                Ok(found) => targets.extend(found),
                Err(e) => {
                    warn!(url = %url, error = %e, "Lookup failed");
                    failures.push(e.to_string());
                }
            }
        }

        if !self.urls.is_empty() && failures.len() == self.urls.len() {
            return Err(Error::DiscoveryUnavailable(failures.join("; ")));
        }

        debug!(topic = %self.topic, targets = targets.len(), "Lookup complete");
        Ok(targets)
    }

    fn poll_interval(&self) -> Option<Duration> {
        (!self.poll_interval.is_zero()).then_some(self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_url() {
        assert_eq!(lookup_url("127.0.0.1:4161"), "http://127.0.0.1:4161/lookup");
        assert_eq!(lookup_url("http://lookupd:4161/"), "http://lookupd:4161/lookup");
        assert_eq!(
            lookup_url("https://lookupd.example.com/lookup"),
            "https://lookupd.example.com/lookup"
        );
    }

    #[test]
    fn test_parse_bare_response() {
        let body = br#"{"channels":["archive"],"producers":[
            {"remote_address":"10.0.0.5:51234","hostname":"nsqd-1","broadcast_address":"nsqd-1.internal","tcp_port":4150,"http_port":4151,"version":"1.3.0"},
            {"broadcast_address":"10.0.0.6","tcp_port":4150}
        ]}"#;
        let targets = parse_lookup_response(body).unwrap();
        assert_eq!(
            targets,
            vec![
                BrokerTarget::new("nsqd-1.internal:4150"),
                BrokerTarget::new("10.0.0.6:4150")
            ]
        );
    }

    #[test]
    fn test_parse_wrapped_response() {
        let body = br#"{"status_code":200,"status_txt":"OK","data":{"channels":[],"producers":[{"broadcast_address":"nsqd","tcp_port":4150}]}}"#;
        let targets = parse_lookup_response(body).unwrap();
        assert_eq!(targets, vec![BrokerTarget::new("nsqd:4150")]);
    }

    #[test]
    fn test_parse_invalid_response() {
        assert!(matches!(
            parse_lookup_response(b"<html>"),
            Err(Error::DiscoveryUnavailable(_))
        ));
    }

    #[test]
    fn test_broker_target_host() {
        assert_eq!(BrokerTarget::new("nsqd.internal:4150").host(), "nsqd.internal");
        assert_eq!(BrokerTarget::new("[::1]:4150").host(), "::1");
        assert_eq!(BrokerTarget::new("nsqd").host(), "nsqd");
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new(vec![
            "b:4150".into(),
            " a:4150 ".into(),
            "".into(),
            "b:4150".into(),
        ]);
        let targets: Vec<_> = resolver.resolve().await.unwrap().into_iter().collect();
        assert_eq!(targets, vec![BrokerTarget::new("a:4150"), BrokerTarget::new("b:4150")]);
        assert!(resolver.poll_interval().is_none());
    }

    #[tokio::test]
    async fn test_lookupd_all_endpoints_down() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver = LookupdResolver::new(
            vec![addr.to_string()],
            "events",
            Duration::from_secs(60),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            resolver.resolve().await,
            Err(Error::DiscoveryUnavailable(_))
        ));
        assert_eq!(resolver.poll_interval(), Some(Duration::from_secs(60)));
    }
}
