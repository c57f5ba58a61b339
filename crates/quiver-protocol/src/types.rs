//! Message data types for protocol transport

use crate::error::{ProtocolError, Result};
use crate::MAX_NAME_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of a message identifier on the wire
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Fixed header length of a message frame (timestamp + attempts + id)
const MESSAGE_HEADER_LENGTH: usize = 8 + 2 + MESSAGE_ID_LENGTH;

// ============================================================================
// Message Id
// ============================================================================

/// Opaque 16-byte message identifier.
///
/// Identifiers are only unique per broker connection; nsqd renders them as
/// hex ASCII but the protocol treats them as raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    /// Build an id from its raw wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; MESSAGE_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidMessageId(String::from_utf8_lossy(bytes).into()))?;
        Ok(Self(raw))
    }

    /// Parse an id from its textual form
    pub fn parse(s: &str) -> Result<Self> {
        Self::from_bytes(s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

impl FromStr for MessageId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Message
// ============================================================================

/// A message as delivered in a `FrameType::Message` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned identifier, unique per connection
    pub id: MessageId,
    /// Publish time in nanoseconds since the Unix epoch
    pub timestamp: i64,
    /// Number of delivery attempts, including this one
    pub attempts: u16,
    /// Raw message body
    pub body: Bytes,
}

impl Message {
    pub fn new(id: MessageId, timestamp: i64, attempts: u16, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            timestamp,
            attempts,
            body: body.into(),
        }
    }

    /// Decode the data section of a message frame
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < MESSAGE_HEADER_LENGTH {
            return Err(ProtocolError::InvalidMessage(format!(
                "frame data is {} bytes, header needs {}",
                data.len(),
                MESSAGE_HEADER_LENGTH
            )));
        }

        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let id = MessageId::from_bytes(&data.split_to(MESSAGE_ID_LENGTH))?;

        Ok(Self {
            id,
            timestamp,
            attempts,
            body: data,
        })
    }

    /// Encode the message into frame data (the inverse of [`Message::decode`])
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(MESSAGE_HEADER_LENGTH + self.body.len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.body);
    }

    /// Publish time in milliseconds since the Unix epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp / 1_000_000
    }
}

// ============================================================================
// Names
// ============================================================================

const EPHEMERAL_SUFFIX: &str = "#ephemeral";

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Validate a topic name (`[.a-zA-Z0-9_-]{1,64}`, optional `#ephemeral` suffix)
pub fn validate_topic_name(name: &str) -> Result<()> {
    validate_name("topic", name)
}

/// Validate a channel name (same rules as topics)
pub fn validate_channel_name(name: &str) -> Result<()> {
    validate_name("channel", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MessageId {
        MessageId::parse(s).unwrap()
    }

    #[test]
    fn test_message_id_parse() {
        let message_id = id("0a1b2c3d4e5f6789");
        assert_eq!(message_id.to_string(), "0a1b2c3d4e5f6789");
        assert_eq!(message_id.as_bytes().len(), 16);

        assert!(MessageId::parse("short").is_err());
        assert!(MessageId::parse("0a1b2c3d4e5f67890").is_err());
    }

    #[test]
    fn test_message_id_serde() {
        let message_id = id("0a1b2c3d4e5f6789");
        let json = serde_json::to_string(&message_id).unwrap();
        assert_eq!(json, "\"0a1b2c3d4e5f6789\"");

        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message_id);

        assert!(serde_json::from_str::<MessageId>("\"nope\"").is_err());
    }

    #[test]
    fn test_message_decode() {
        let msg = Message::new(id("0000000000000001"), 1_700_000_000_000_000_000, 3, "hello");
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let decoded = Message::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.attempts, 3);
        assert_eq!(decoded.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(&decoded.body[..], b"hello");
    }

    #[test]
    fn test_message_decode_empty_body() {
        let msg = Message::new(id("0000000000000002"), 0, 1, Bytes::new());
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let decoded = Message::decode(buf.freeze()).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_message_decode_truncated() {
        let err = Message::decode(Bytes::from_static(&[0u8; 12])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_validate_names() {
        assert!(validate_topic_name("events").is_ok());
        assert!(validate_topic_name("events.v2_raw-1").is_ok());
        assert!(validate_channel_name("archive#ephemeral").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name("#ephemeral").is_err());
        assert!(validate_channel_name(&"c".repeat(65)).is_err());
        assert!(validate_channel_name(&"c".repeat(64)).is_ok());
    }
}
