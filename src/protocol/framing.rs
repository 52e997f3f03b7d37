//! Reliable stream framing
//!
//! Every message on a reliable stream is a 4-byte big-endian length followed by
//! exactly that many payload bytes. Frames the relay forwards may carry the
//! sender's identity in front of the inner record:
//!
//! ```text
//! ┌──────────────┬──────────┬──────────────────┬─────────────────┐
//! │ length (u32) │ id_len   │ sender id (UTF-8)│ inner record    │
//! │ big-endian   │ (u8)     │ id_len bytes     │                 │
//! └──────────────┴──────────┴──────────────────┴─────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Read one frame, looping partial reads until it is complete.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary; an end
/// of stream inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len }.into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Sender identity the relay puts in front of forwarded stream records
pub struct RelayPrefix;

impl RelayPrefix {
    /// Prepend `sender_id` to `inner`
    pub fn wrap(sender_id: &str, inner: &[u8]) -> Result<Bytes> {
        let id = sender_id.as_bytes();
        if id.len() > u8::MAX as usize {
            return Err(ProtocolError::SenderIdTooLong(id.len()).into());
        }

        let mut buf = BytesMut::with_capacity(1 + id.len() + inner.len());
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_slice(inner);
        Ok(buf.freeze())
    }

    /// Split a forwarded payload into sender id and inner record
    pub fn split(payload: Bytes) -> Result<(String, Bytes)> {
        let id_len = *payload.first().ok_or(ProtocolError::TruncatedHeader(0))? as usize;
        if payload.len() < 1 + id_len {
            return Err(ProtocolError::TruncatedHeader(payload.len()).into());
        }

        let id = std::str::from_utf8(&payload[1..1 + id_len])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        Ok((id, payload.slice(1 + id_len..)))
    }
}

/// First frame a peer sends on each reliable connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Id issued on an earlier connection, `None` on the first one
    pub client_id: Option<Uuid>,
    pub user: String,
}

/// Relay's answer to a [`Handshake`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub client_id: Uuid,
}

impl Handshake {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()).into())
    }
}

impl Welcome {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_frame(&mut client, b"first").await.unwrap();
            write_frame(&mut client, &[7u8; 300]).await.unwrap();
        });

        let first = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(&first[..], b"first");

        // larger than the duplex buffer, so it arrives in pieces
        let second = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(second.len(), 300);

        writer.await.unwrap();
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_header_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2, 3]).await.unwrap();
        drop(client);

        assert!(read_frame(&mut server, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(5_000u32).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameTooLarge { len: 5_000, max: 1024 })
        ));
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(b"abc");
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_relay_prefix() {
        let wrapped = RelayPrefix::wrap("peer-1", b"record").unwrap();
        assert_eq!(wrapped[0], 6);

        let (id, inner) = RelayPrefix::split(wrapped).unwrap();
        assert_eq!(id, "peer-1");
        assert_eq!(&inner[..], b"record");

        assert!(RelayPrefix::split(Bytes::from_static(&[9, b'a'])).is_err());
        assert!(RelayPrefix::split(Bytes::new()).is_err());
    }

    #[test]
    fn test_handshake_encoding() {
        let id = Uuid::new_v4();
        let hs = Handshake { client_id: Some(id), user: "ana".into() };
        assert_eq!(Handshake::decode(&hs.encode().unwrap()).unwrap(), hs);

        let welcome = Welcome { client_id: id };
        assert_eq!(Welcome::decode(&welcome.encode().unwrap()).unwrap(), welcome);
    }
}
