//! Stream wire format for data channel messages.
//!
//! # Wire format
//!
//! ```text
//! PREAMBLE (connecting side -> accepting side, once):
//!   [32 bytes: session token, hex ASCII]
//!
//! PER MESSAGE (both directions):
//!   [1 byte: kind, 0x01 = text, 0x02 = binary]
//!   [4 bytes BE: payload_len]
//!   [payload_len bytes: payload, UTF-8 for text]
//! ```
//!
//! A clean end of stream between two frames closes the channel.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

/// Frame kind: UTF-8 text.
pub const KIND_TEXT: u8 = 0x01;

/// Frame kind: opaque binary.
pub const KIND_BINARY: u8 = 0x02;

/// Largest accepted frame payload (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Session token length in bytes (32 hex characters).
pub const TOKEN_LEN: usize = 32;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ChannelError> {
    let (kind, payload) = match frame {
        Frame::Text(text) => (KIND_TEXT, text.as_bytes()),
        Frame::Binary(data) => (KIND_BINARY, data.as_ref()),
    };
    if payload.len() > MAX_FRAME_LEN {
        return Err(ChannelError::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_LEN})",
            payload.len()
        )));
    }

    writer.write_u8(kind).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Reads one frame from the stream.
///
/// Returns `None` if the stream ends cleanly before a new frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ChannelError> {
    let mut kind = [0u8; 1];
    if reader.read(&mut kind).await? == 0 {
        return Ok(None);
    }

    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_LEN})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    match kind[0] {
        KIND_TEXT => {
            let text = String::from_utf8(payload)
                .map_err(|e| ChannelError::Protocol(format!("invalid UTF-8 text frame: {e}")))?;
            Ok(Some(Frame::Text(text)))
        }
        KIND_BINARY => Ok(Some(Frame::Binary(Bytes::from(payload)))),
        other => Err(ChannelError::Protocol(format!(
            "unknown frame kind 0x{other:02x}"
        ))),
    }
}

/// Writes the session token preamble (32 hex ASCII bytes).
pub async fn write_token<W: AsyncWrite + Unpin>(
    writer: &mut W,
    token: &str,
) -> Result<(), ChannelError> {
    if token.len() != TOKEN_LEN {
        return Err(ChannelError::Protocol(format!(
            "token must be {TOKEN_LEN} bytes, got {}",
            token.len()
        )));
    }
    writer.write_all(token.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the session token preamble (32 hex ASCII bytes).
pub async fn read_token<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ChannelError> {
    let mut buf = [0u8; TOKEN_LEN];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| ChannelError::Protocol(format!("invalid token encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_keep_their_order() {
        let frames = vec![
            Frame::Text(r#"{"size":3}"#.into()),
            Frame::Binary(Bytes::from_static(&[1, 2])),
            Frame::Binary(Bytes::from_static(&[3])),
        ];

        let mut buf = Vec::new();
        for f in &frames {
            write_frame(&mut buf, f).await.unwrap();
        }

        let mut cursor = &buf[..];
        for expected in &frames {
            let parsed = read_frame(&mut cursor).await.unwrap().unwrap();
            assert_eq!(&parsed, expected);
        }
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_header_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Binary(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        assert_eq!(buf, vec![KIND_BINARY, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_write() {
        let frame = Frame::Binary(Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]));
        let mut buf = Vec::new();
        assert!(write_frame(&mut buf, &frame).await.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_rejected_on_read() {
        let mut buf = vec![KIND_BINARY];
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let buf = vec![0x7f, 0, 0, 0, 0];
        let mut cursor = &buf[..];
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let buf = vec![KIND_TEXT, 0, 0, 0, 10, b'x'];
        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ChannelError::Io(_))
        ));
    }

    #[tokio::test]
    async fn token_roundtrip() {
        let token = "a1b2c3d4e5f6a7b8a1b2c3d4e5f6a7b8";

        let mut buf = Vec::new();
        write_token(&mut buf, token).await.unwrap();

        let mut cursor = &buf[..];
        assert_eq!(read_token(&mut cursor).await.unwrap(), token);
    }

    #[tokio::test]
    async fn invalid_token_length() {
        let mut buf = Vec::new();
        assert!(write_token(&mut buf, "too_short").await.is_err());
    }
}
