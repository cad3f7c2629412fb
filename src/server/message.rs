//! Library <-> daemon socket messages.
//!
//! Every socket in the host interface carries discrete messages framed by a
//! 4-byte little-endian length prefix. Control-socket messages then have a
//! 2-byte header:
//!
//! ```text
//! +--------+----------+-----------+
//! | Type   | Endpoint | Payload   |
//! | 1 byte | 1 byte   | n bytes   |
//! +--------+----------+-----------+
//! ```
//!
//! Endpoint data sockets carry raw payloads inside the same length framing.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::MAX_WRITE_SIZE;

/// Upper bound for any message on a host socket.
const MAX_MESSAGE_SIZE: usize = MAX_WRITE_SIZE + 16;

/// Control-socket request/reply types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeKind {
    /// Library/daemon protocol version check.
    VersionQuery = 0,
    /// Largest payload accepted per write.
    MaxWriteSizeQuery = 1,
    /// Register the client's pid for reset signalling.
    SetPid = 2,
    /// May this endpoint be opened? Also used as the data-socket ack.
    OpenEndpointQuery = 3,
    /// Close an endpoint. Idempotent.
    CloseEndpointQuery = 4,
    /// Read an endpoint's state code.
    EndpointStatusQuery = 5,
}

impl ExchangeKind {
    /// Parse the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::VersionQuery),
            1 => Some(Self::MaxWriteSizeQuery),
            2 => Some(Self::SetPid),
            3 => Some(Self::OpenEndpointQuery),
            4 => Some(Self::CloseEndpointQuery),
            5 => Some(Self::EndpointStatusQuery),
            _ => None,
        }
    }
}

/// One control-socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMessage {
    /// Message type.
    pub kind: ExchangeKind,
    /// Endpoint the message concerns; 0 when not applicable.
    pub endpoint: u8,
    /// Type-specific payload.
    pub payload: Vec<u8>,
}

impl ExchangeMessage {
    /// Build a message.
    pub fn new(kind: ExchangeKind, endpoint: u8, payload: Vec<u8>) -> Self {
        Self {
            kind,
            endpoint,
            payload,
        }
    }

    /// Serialize without the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.payload.len());
        buf.push(self.kind as u8);
        buf.push(self.endpoint);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a message body.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < 2 {
            return Err(MessageError::Truncated);
        }
        let kind = ExchangeKind::from_byte(data[0]).ok_or(MessageError::UnknownType(data[0]))?;
        Ok(Self {
            kind,
            endpoint: data[1],
            payload: data[2..].to_vec(),
        })
    }
}

/// Errors on the host sockets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Message body shorter than its fixed header.
    #[error("truncated exchange message")]
    Truncated,
    /// Unknown message type byte.
    #[error("unknown exchange message type 0x{0:02x}")]
    UnknownType(u8),
    /// Length prefix beyond the allowed maximum.
    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// Write one length-prefixed message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one length-prefixed message. `Ok(None)` on clean EOF.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            MessageError::TooLarge(len).to_string(),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
