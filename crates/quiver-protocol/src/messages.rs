//! Protocol message types

use crate::error::{ProtocolError, Result};
use crate::metadata::IdentifyRequest;
use crate::types::{Message, MessageId};
use crate::{CLOSE_WAIT, HEARTBEAT, OK};
use bytes::{BufMut, Bytes, BytesMut};

/// Commands sent from the consumer to the broker
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Feature negotiation, must be the first command after the magic
    Identify(IdentifyRequest),

    /// Authenticate with a shared secret
    Auth(String),

    /// Subscribe to a topic/channel
    Sub { topic: String, channel: String },

    /// Grant the broker credit for `n` in-flight messages
    Rdy(u64),

    /// Finish a message
    Fin(MessageId),

    /// Requeue a message, delaying redelivery by `timeout_ms`
    Req { id: MessageId, timeout_ms: u64 },

    /// Reset the server-side timeout of an in-flight message
    Touch(MessageId),

    /// No-op, the answer to a heartbeat
    Nop,

    /// Start a clean close; the broker answers `CLOSE_WAIT`
    Cls,
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
        }
    }

    /// Append the encoded command to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Command::Identify(identify) => {
                let body = serde_json::to_vec(identify)?;
                put_line(buf, &["IDENTIFY"]);
                put_sized_body(buf, &body);
            }
            Command::Auth(secret) => {
                put_line(buf, &["AUTH"]);
                put_sized_body(buf, secret.as_bytes());
            }
            Command::Sub { topic, channel } => put_line(buf, &["SUB", topic, channel]),
            Command::Rdy(count) => put_line(buf, &["RDY", &count.to_string()]),
            Command::Fin(id) => put_line(buf, &["FIN", &id.to_string()]),
            Command::Req { id, timeout_ms } => {
                put_line(buf, &["REQ", &id.to_string(), &timeout_ms.to_string()])
            }
            Command::Touch(id) => put_line(buf, &["TOUCH", &id.to_string()]),
            Command::Nop => put_line(buf, &["NOP"]),
            Command::Cls => put_line(buf, &["CLS"]),
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn put_line(buf: &mut BytesMut, parts: &[&str]) {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b' ');
        }
        buf.put_slice(part.as_bytes());
    }
    buf.put_u8(b'\n');
}

fn put_sized_body(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}

// ============================================================================
// Frames
// ============================================================================

/// Frame type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// A decoded broker frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    /// Build a frame from its type and data section
    pub fn parse(frame_type: FrameType, data: Bytes) -> Result<Self> {
        Ok(match frame_type {
            FrameType::Response => Frame::Response(data),
            FrameType::Error => Frame::Error(data),
            FrameType::Message => Frame::Message(Message::decode(data)?),
        })
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Message(_) => FrameType::Message,
        }
    }

    /// Encode the frame, including its size prefix
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut data = BytesMut::new();
        match self {
            Frame::Response(body) | Frame::Error(body) => data.put_slice(body),
            Frame::Message(message) => message.encode(&mut data),
        }
        buf.put_u32(4 + data.len() as u32);
        buf.put_u32(self.frame_type() as u32);
        buf.put_slice(&data);
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(body) if &body[..] == OK)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if &body[..] == HEARTBEAT)
    }

    pub fn is_close_wait(&self) -> bool {
        matches!(self, Frame::Response(body) if &body[..] == CLOSE_WAIT)
    }

    /// Turn an error frame into a [`ProtocolError::Broker`]
    pub fn into_result(self) -> Result<Self> {
        match self {
            Frame::Error(body) => Err(ProtocolError::Broker(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> MessageId {
        MessageId::parse("0a1b2c3d4e5f6789").unwrap()
    }

    #[test]
    fn test_encode_simple_commands() {
        let cases = vec![
            (
                Command::Sub {
                    topic: "t".into(),
                    channel: "c".into(),
                },
                "SUB t c\n",
            ),
            (Command::Rdy(25), "RDY 25\n"),
            (Command::Fin(id()), "FIN 0a1b2c3d4e5f6789\n"),
            (
                Command::Req {
                    id: id(),
                    timeout_ms: 5000,
                },
                "REQ 0a1b2c3d4e5f6789 5000\n",
            ),
            (Command::Touch(id()), "TOUCH 0a1b2c3d4e5f6789\n"),
            (Command::Nop, "NOP\n"),
            (Command::Cls, "CLS\n"),
        ];

        for (command, expected) in cases {
            let bytes = command.to_bytes().unwrap();
            assert_eq!(&bytes[..], expected.as_bytes(), "{}", command.name());
        }
    }

    #[test]
    fn test_encode_auth() {
        let bytes = Command::Auth("s3cret".into()).to_bytes().unwrap();
        assert_eq!(&bytes[..5], b"AUTH\n");
        assert_eq!(&bytes[5..9], &6u32.to_be_bytes());
        assert_eq!(&bytes[9..], b"s3cret");
    }

    #[test]
    fn test_encode_identify() {
        let identify = IdentifyRequest {
            client_id: "worker-1".into(),
            ..Default::default()
        };
        let bytes = Command::Identify(identify).to_bytes().unwrap();

        assert!(bytes.starts_with(b"IDENTIFY\n"));
        let size = u32::from_be_bytes(bytes[9..13].try_into().unwrap()) as usize;
        assert_eq!(size, bytes.len() - 13);

        let body: serde_json::Value = serde_json::from_slice(&bytes[13..]).unwrap();
        assert_eq!(body["client_id"], "worker-1");
        assert_eq!(body["feature_negotiation"], true);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0).unwrap(), FrameType::Response);
        assert_eq!(FrameType::try_from(1).unwrap(), FrameType::Error);
        assert_eq!(FrameType::try_from(2).unwrap(), FrameType::Message);
        assert!(matches!(
            FrameType::try_from(9),
            Err(ProtocolError::UnknownFrameType(9))
        ));
    }

    #[test]
    fn test_special_responses() {
        assert!(Frame::Response(Bytes::from_static(b"OK")).is_ok());
        assert!(Frame::Response(Bytes::from_static(b"_heartbeat_")).is_heartbeat());
        assert!(Frame::Response(Bytes::from_static(b"CLOSE_WAIT")).is_close_wait());
        assert!(!Frame::Error(Bytes::from_static(b"OK")).is_ok());
    }

    #[test]
    fn test_error_frame_into_result() {
        let err = Frame::Error(Bytes::from_static(b"E_BAD_TOPIC"))
            .into_result()
            .unwrap_err();
        assert_eq!(err.to_string(), "Broker error: E_BAD_TOPIC");
    }
}
