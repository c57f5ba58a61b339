//! Deliveries handed downstream and the tokens used to acknowledge them

use crate::connection::ConnectionId;
use bytes::Bytes;
use quiver_protocol::MessageId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Key of the token object inside a delivery envelope
pub const ENVELOPE_TOKEN_KEY: &str = "_nsq";

/// Correlates a delivery with its in-flight entry.
///
/// Downstream code holds on to the token and passes it back to
/// [`Consumer::finish`](crate::Consumer::finish) and friends. Tokens are
/// plain values; acknowledging a stale or foreign token is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckToken {
    pub id: MessageId,
    /// Connection that delivered the message
    pub connection: ConnectionId,
    /// Consumer that issued the token
    pub node_id: String,
    /// Publish time in nanoseconds since the Unix epoch
    pub timestamp: i64,
    /// Delivery attempts as reported by the broker
    pub attempts: u16,
    /// Time left before the broker redelivers, serialized in seconds
    #[serde(rename = "timeout", with = "duration_secs")]
    pub timeout_remaining: Duration,
    pub has_responded: bool,
}

impl AckToken {
    /// Recover a token from a delivery envelope (`{"_nsq": {...}, ...}`).
    ///
    /// Returns `None` for anything that does not carry a well-formed token.
    pub fn from_envelope(envelope: &Value) -> Option<Self> {
        let token = envelope.get(ENVELOPE_TOKEN_KEY)?;
        if !token.is_object() {
            return None;
        }
        serde_json::from_value(token.clone()).ok()
    }

    /// Write this token back into an envelope, replacing the previous one
    pub fn write_to_envelope(&self, envelope: &mut Value) {
        if let (Some(object), Ok(token)) = (envelope.as_object_mut(), serde_json::to_value(self)) {
            object.insert(ENVELOPE_TOKEN_KEY.to_string(), token);
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }
}

/// Result of an acknowledgment call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledgment was applied and sent to the broker
    Applied,
    /// Unknown, stale, foreign or already answered token
    Ignored,
}

impl AckOutcome {
    pub fn is_applied(self) -> bool {
        self == AckOutcome::Applied
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Json(Value),
    /// Body that is not valid JSON, as (lossy) UTF-8 text
    Text(String),
}

impl Payload {
    /// Decode a body as JSON, falling back to text
    pub fn decode(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(body).into_owned()),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Payload::Json(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Text(text) => Value::String(text.clone()),
        }
    }
}

/// A message handed to the downstream handler
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: AckToken,
    pub payload: Payload,
    /// Undecoded body
    pub body: Bytes,
}

impl Delivery {
    /// `{"_nsq": <token>, "payload": <payload>}`
    pub fn to_envelope(&self) -> Value {
        let mut envelope = serde_json::json!({ "payload": self.payload.to_value() });
        self.token.write_to_envelope(&mut envelope);
        envelope
    }
}

/// Downstream sink for deliveries
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, delivery: Delivery);
}

impl<F> MessageHandler for F
where
    F: Fn(Delivery) + Send + Sync + 'static,
{
    fn handle(&self, delivery: Delivery) {
        self(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> AckToken {
        AckToken {
            id: MessageId::parse("0a1b2c3d4e5f6789").unwrap(),
            connection: ConnectionId::new(4),
            node_id: "node-1".into(),
            timestamp: 1_700_000_000_000_000_000,
            attempts: 2,
            timeout_remaining: Duration::from_millis(59_500),
            has_responded: false,
        }
    }

    #[test]
    fn test_payload_decode() {
        assert_eq!(
            Payload::decode(br#"{"order":42}"#),
            Payload::Json(serde_json::json!({"order": 42}))
        );
        assert_eq!(Payload::decode(b"42"), Payload::Json(serde_json::json!(42)));
        assert_eq!(
            Payload::decode(b"not json {"),
            Payload::Text("not json {".into())
        );
        assert_eq!(Payload::decode(b""), Payload::Text(String::new()));
    }

    #[test]
    fn test_envelope_shape() {
        let delivery = Delivery {
            token: token(),
            payload: Payload::Text("hello".into()),
            body: Bytes::from_static(b"hello"),
        };
        let envelope = delivery.to_envelope();

        assert_eq!(envelope["payload"], "hello");
        let nsq = &envelope["_nsq"];
        assert_eq!(nsq["id"], "0a1b2c3d4e5f6789");
        assert_eq!(nsq["node_id"], "node-1");
        assert_eq!(nsq["attempts"], 2);
        assert_eq!(nsq["timeout"], 59.5);
        assert_eq!(nsq["has_responded"], false);
        assert_eq!(nsq["connection"], 4);
    }

    #[test]
    fn test_token_from_envelope() {
        let delivery = Delivery {
            token: token(),
            payload: Payload::Json(serde_json::json!({"a": 1})),
            body: Bytes::from_static(br#"{"a":1}"#),
        };
        let envelope = delivery.to_envelope();
        assert_eq!(AckToken::from_envelope(&envelope), Some(token()));
    }

    #[test]
    fn test_malformed_envelopes() {
        let cases = vec![
            serde_json::json!(null),
            serde_json::json!("string"),
            serde_json::json!({"payload": 1}),
            serde_json::json!({"_nsq": "abc"}),
            serde_json::json!({"_nsq": {"id": "short"}}),
            serde_json::json!({"_nsq": {"id": "0a1b2c3d4e5f6789", "node_id": "n"}}),
        ];
        for envelope in cases {
            assert!(AckToken::from_envelope(&envelope).is_none(), "{}", envelope);
        }
    }

    #[test]
    fn test_write_token_back() {
        let mut envelope = serde_json::json!({"payload": "x", "extra": true});
        let mut updated = token();
        updated.has_responded = true;
        updated.write_to_envelope(&mut envelope);

        assert_eq!(envelope["_nsq"]["has_responded"], true);
        assert_eq!(envelope["extra"], true);
    }
}
