//! Quiver Wire Protocol
//!
//! This crate defines the NSQ TCP protocol (V2) as spoken between a quiver
//! consumer and an `nsqd` broker: outbound commands, inbound frames, the
//! message frame layout and the IDENTIFY feature negotiation types.
//!
//! # Framing
//!
//! Every broker frame is length prefixed:
//!
//! ```text
//! [ 4-byte size ][ 4-byte frame type ][ data ... ]
//! ```
//!
//! where `size` covers the frame type and the data. Message frames carry:
//!
//! ```text
//! [ 8-byte timestamp (ns) ][ 2-byte attempts ][ 16-byte id ][ body ... ]
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quiver_protocol::{Command, MessageId};
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! Command::Fin(MessageId::parse("0a0b0c0d0e0f1011")?).encode(&mut buf)?;
//! assert_eq!(&buf[..], b"FIN 0a0b0c0d0e0f1011\n");
//! ```

mod codec;
mod error;
mod messages;
mod metadata;
mod types;

pub use codec::{read_frame, write_command};
pub use error::{ProtocolError, Result};
pub use messages::{Command, Frame, FrameType};
pub use metadata::{AuthResponse, IdentifyRequest, IdentifyResponse};
pub use types::{validate_channel_name, validate_topic_name, Message, MessageId};

/// Protocol magic sent right after the TCP connection is established
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Maximum accepted frame size (type + data), matching nsqd's default
/// `--max-msg-size` plus framing overhead.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 + 64;

/// Response body for a successful command
pub const OK: &[u8] = b"OK";

/// Response body the broker uses for heartbeats
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Response body acknowledging `CLS`
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Maximum length of a topic or channel name
pub const MAX_NAME_LENGTH: usize = 64;
