//! Length-prefixed message framing.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! +----------+-------------+--------------+------------------+
//! | key len  | key (UTF-8) | payload len  | payload          |
//! | u16      | key-len B   | u32          | payload-len B    |
//! +----------+-------------+--------------+------------------+
//! ```
//!
//! The core never sees wire bytes; this module converts between frames
//! and [`Message`] values at the transport boundary.

use bytes::{BufMut, Bytes, BytesMut};
use switchboard_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

/// Largest accepted routing key, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Largest accepted payload, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Encode a message into one frame.
pub fn encode(message: &Message) -> Result<Bytes, WireError> {
    let key = message.key.as_bytes();
    if key.len() > MAX_KEY_LEN {
        return Err(WireError::KeyTooLarge(key.len()));
    }
    if message.payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(message.payload.len()));
    }

    let mut frame = BytesMut::with_capacity(2 + key.len() + 4 + message.payload.len());
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_KEY_LEN above
    frame.put_u16(key.len() as u16);
    frame.put_slice(key);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_LEN above
    frame.put_u32(message.payload.len() as u32);
    frame.put_slice(&message.payload);
    Ok(frame.freeze())
}

/// Read one frame. EOF before the first header byte surfaces as
/// [`WireError::Closed`] (a clean peer close); EOF anywhere after that is
/// a truncated frame and stays an I/O error.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Err(WireError::Closed);
    }
    reader.read_exact(&mut header[first..]).await?;
    let key_len = usize::from(u16::from_be_bytes(header));
    if key_len > MAX_KEY_LEN {
        return Err(WireError::KeyTooLarge(key_len));
    }
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key).await?;
    let key = String::from_utf8(key).map_err(|_| WireError::KeyNotUtf8)?;

    let payload_len = reader.read_u32().await? as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload_len));
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(Message::new(key, payload))
}

/// Encode and write one frame.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let message = Message::new("chat/say", "hello there");

        write_message(&mut client, &message).await.unwrap();
        let decoded = read_message(&mut server).await.unwrap();

        assert_eq!(decoded.key, "chat/say");
        assert_eq!(decoded.payload, Bytes::from("hello there"));
        assert!(decoded.origin.is_none());
    }

    #[tokio::test]
    async fn empty_payload_is_valid() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_message(&mut client, &Message::new("ping", "")).await.unwrap();
        let decoded = read_message(&mut server).await.unwrap();

        assert_eq!(decoded.key, "ping");
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_key_is_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u16(u16::MAX).await.unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(WireError::KeyTooLarge(_))));
    }

    #[test]
    fn encode_rejects_oversized_key() {
        let message = Message::new("k".repeat(MAX_KEY_LEN + 1), "");
        assert!(matches!(encode(&message), Err(WireError::KeyTooLarge(_))));
    }

    #[tokio::test]
    async fn invalid_utf8_key_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u16(2).await.unwrap();
        client.write_all(&[0xff, 0xfe]).await.unwrap();
        client.write_u32(0).await.unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(WireError::KeyNotUtf8)));
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_clean() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_message(&mut server).await.unwrap_err();
        assert!(err.is_clean_eof());
    }

    #[tokio::test]
    async fn eof_inside_the_header_is_not_clean() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u8(0).await.unwrap();
        drop(client);

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
        assert!(!err.is_clean_eof());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_still_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u16(4).await.unwrap();
        client.write_all(b"ab").await.unwrap();
        drop(client);

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
        assert!(!err.is_clean_eof());
    }
}
