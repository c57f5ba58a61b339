//! IDENTIFY / AUTH negotiation bodies

use crate::error::Result;
use crate::OK;
use serde::{Deserialize, Serialize};

/// Body of the `IDENTIFY` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyRequest {
    /// Short client identifier shown in nsqadmin
    pub client_id: String,
    /// Hostname of the consumer
    pub hostname: String,
    /// Client library/version string
    pub user_agent: String,
    /// Ask the broker to answer with a JSON body instead of `OK`
    pub feature_negotiation: bool,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: i64,
    /// Requested message timeout in milliseconds (0 = broker default)
    #[serde(skip_serializing_if = "is_zero")]
    pub msg_timeout: u64,
    /// Request a TLS upgrade after IDENTIFY
    pub tls_v1: bool,
    /// Broker-side output buffer size in bytes (0 = broker default)
    #[serde(skip_serializing_if = "is_zero")]
    pub output_buffer_size: u64,
    /// Broker-side output buffer flush timeout in milliseconds (0 = broker default)
    #[serde(skip_serializing_if = "is_zero")]
    pub output_buffer_timeout: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Default for IdentifyRequest {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            hostname: String::new(),
            user_agent: concat!("quiver/", env!("CARGO_PKG_VERSION")).to_string(),
            feature_negotiation: true,
            heartbeat_interval: 30_000,
            msg_timeout: 0,
            tls_v1: false,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

/// Negotiated settings returned by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    /// Largest RDY count the broker accepts from this client
    pub max_rdy_count: u64,
    /// Broker version string
    pub version: String,
    /// Effective message timeout in milliseconds
    pub msg_timeout: u64,
    /// Broker agreed to upgrade to TLS
    pub tls_v1: bool,
    /// Client must send AUTH before SUB
    pub auth_required: bool,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            max_rdy_count: 2500,
            version: String::new(),
            msg_timeout: 60_000,
            tls_v1: false,
            auth_required: false,
        }
    }
}

impl IdentifyResponse {
    /// Decode the IDENTIFY response body.
    ///
    /// Brokers without feature negotiation answer a bare `OK`, which maps to
    /// the defaults.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body == OK {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Body returned by the broker after a successful `AUTH`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: String,
    pub permission_count: u64,
}

impl AuthResponse {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}
