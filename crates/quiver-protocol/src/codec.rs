//! Async frame reader / command writer

use crate::error::{ProtocolError, Result};
use crate::messages::{Command, Frame, FrameType};
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one complete frame.
///
/// Not cancellation safe: a partially read frame is lost if the future is
/// dropped, so callers run it in a dedicated reader task.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await? as usize;

    // Validate frame size to prevent memory exhaustion from a misbehaving broker
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(size, MAX_FRAME_SIZE));
    }
    if size < 4 {
        return Err(ProtocolError::InvalidMessage(format!(
            "frame size {} smaller than frame type",
            size
        )));
    }

    let frame_type = FrameType::try_from(reader.read_u32().await?)?;

    let mut data = vec![0u8; size - 4];
    reader.read_exact(&mut data).await?;

    Frame::parse(frame_type, Bytes::from(data))
}

/// Encode and flush a single command
pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    command.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, MessageId};

    #[tokio::test]
    async fn test_read_frames_in_sequence() {
        let message = Message::new(MessageId::parse("aaaaaaaaaaaaaaaa").unwrap(), 5, 2, "body");

        let mut wire = BytesMut::new();
        Frame::Response(Bytes::from_static(b"OK")).encode(&mut wire);
        Frame::Message(message.clone()).encode(&mut wire);
        Frame::Error(Bytes::from_static(b"E_INVALID")).encode(&mut wire);

        let mut reader = &wire[..];
        assert!(read_frame(&mut reader).await.unwrap().is_ok());
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Message(message)
        );
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Error(Bytes::from_static(b"E_INVALID"))
        );
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_too_large() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());

        let mut reader = &wire[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::FrameTooLarge(_, _))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_unknown_type() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&4u32.to_be_bytes());
        wire.extend_from_slice(&3u32.to_be_bytes());

        let mut reader = &wire[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::UnknownFrameType(3))
        ));
    }

    #[tokio::test]
    async fn test_write_command() {
        let mut out: Vec<u8> = Vec::new();
        write_command(&mut out, &Command::Rdy(3)).await.unwrap();
        assert_eq!(out, b"RDY 3\n");
    }
}
