//! Wire protocol types for the bridge
//!
//! Stream format (socket transports):
//! ```text
//! [4 bytes: body length (u32 BE)][body]
//! ```
//!
//! Body format:
//! ```text
//! Call:
//!   [1 byte: kind = 0]
//!   [8 bytes: call id (u64 BE)]
//!   [1 byte: channel name length (u8)]
//!   [channel name bytes (UTF-8)]
//!   [arguments (MessagePack Vec<Value>)]
//!
//! Reply:
//!   [1 byte: kind = 1]
//!   [8 bytes: call id (u64 BE)]
//!   [1 byte: success flag (0 or 1)]
//!   [payload (MessagePack Value on success, Failure otherwise)]
//! ```

use std::io;

use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CallError, ErrorKind, MarshalingError};
use crate::marshal::Value;
use crate::registry::MAX_CHANNEL_NAME_LEN;

const KIND_CALL: u8 = 0;
const KIND_REPLY: u8 = 1;

/// Errors in framing or decoding
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid protocol: {0}")]
    Invalid(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// One call from guest to host
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: u64,
    pub channel: String,
    pub arguments: Vec<Value>,
}

/// Failure reported back to the guest
///
/// Only the minimal descriptor travels; handler failures carry a reference id
/// instead of the handler's own error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    UnknownChannel { channel: String },
    Marshaling(MarshalingError),
    Handler { channel: String, reference: u64 },
    Protocol { channel: String, message: String },
}

impl Failure {
    /// Error kind reported to the caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownChannel { .. } => ErrorKind::UnknownChannel,
            Self::Marshaling(_) => ErrorKind::Marshaling,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Protocol { .. } => ErrorKind::Protocol,
        }
    }
}

impl From<Failure> for CallError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::UnknownChannel { channel } => CallError::UnknownChannel(channel),
            Failure::Marshaling(e) => CallError::Marshaling(e),
            Failure::Handler { channel, reference } => CallError::Handler { channel, reference },
            Failure::Protocol { channel, message } => CallError::Protocol { channel, message },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(Failure),
}

/// The host's answer to one [`Invocation`]
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub outcome: Outcome,
}

impl Reply {
    /// Successful reply carrying the result
    pub fn success(id: u64, value: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success(value),
        }
    }

    /// Failed reply for call `id`
    pub fn failure(id: u64, failure: Failure) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(failure),
        }
    }
}

/// A decoded frame body
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Invocation),
    Reply(Reply),
}

impl Frame {
    /// Serialize to a frame body (without the length prefix)
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Frame::Call(call) => {
                let name = call.channel.as_bytes();
                if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LEN {
                    return Err(ProtocolError::Invalid(format!(
                        "channel name length {} out of range",
                        name.len()
                    )));
                }
                let arguments = rmp_serde::to_vec(&call.arguments)?;

                let mut buf = Vec::with_capacity(1 + 8 + 1 + name.len() + arguments.len());
                buf.push(KIND_CALL);
                buf.extend_from_slice(&call.id.to_be_bytes());
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
                buf.extend_from_slice(&arguments);
                Ok(buf)
            }
            Frame::Reply(reply) => {
                let (success, payload) = match &reply.outcome {
                    Outcome::Success(value) => (1u8, rmp_serde::to_vec(value)?),
                    Outcome::Failure(failure) => (0u8, rmp_serde::to_vec(failure)?),
                };

                let mut buf = Vec::with_capacity(1 + 8 + 1 + payload.len());
                buf.push(KIND_REPLY);
                buf.extend_from_slice(&reply.id.to_be_bytes());
                buf.push(success);
                buf.extend_from_slice(&payload);
                Ok(buf)
            }
        }
    }

    /// Parse a frame body
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind, rest) = data
            .split_first()
            .ok_or_else(|| ProtocolError::Invalid("empty frame".to_string()))?;
        if rest.len() < 9 {
            return Err(ProtocolError::Invalid("truncated header".to_string()));
        }
        let (id_bytes, rest) = rest.split_at(8);
        let mut id = [0u8; 8];
        id.copy_from_slice(id_bytes);
        let id = u64::from_be_bytes(id);

        match kind {
            KIND_CALL => {
                let name_len = rest[0] as usize;
                let rest = &rest[1..];
                if name_len == 0 || rest.len() < name_len {
                    return Err(ProtocolError::Invalid("truncated channel name".to_string()));
                }
                let channel = std::str::from_utf8(&rest[..name_len])
                    .map_err(|e| ProtocolError::Invalid(format!("invalid channel UTF-8: {e}")))?
                    .to_string();
                let arguments = rmp_serde::from_slice(&rest[name_len..])?;
                Ok(Frame::Call(Invocation {
                    id,
                    channel,
                    arguments,
                }))
            }
            KIND_REPLY => {
                let outcome = match rest[0] {
                    1 => Outcome::Success(rmp_serde::from_slice(&rest[1..])?),
                    0 => Outcome::Failure(rmp_serde::from_slice(&rest[1..])?),
                    flag => {
                        return Err(ProtocolError::Invalid(format!("invalid success flag {flag}")));
                    }
                };
                Ok(Frame::Reply(Reply { id, outcome }))
            }
            other => Err(ProtocolError::Invalid(format!("unknown frame kind {other}"))),
        }
    }
}

/// Id and channel of a call frame whose arguments may not decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub id: u64,
    pub channel: String,
}

impl CallHeader {
    /// Read just the header of a call frame body
    ///
    /// Returns `None` unless the frame is a call with an id and a complete
    /// channel name. Invalid UTF-8 in the name is replaced.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 10 || data[0] != KIND_CALL {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[1..9]);
        let name_len = data[9] as usize;
        let name = data.get(10..10 + name_len).filter(|name| !name.is_empty())?;
        Some(Self {
            id: u64::from_be_bytes(id),
            channel: String::from_utf8_lossy(name).into_owned(),
        })
    }
}

/// Prepend the length prefix to a frame body
pub fn with_length_prefix(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Read one length-prefixed frame body
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::Invalid("zero-length frame".to_string()));
    }
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame body with its length prefix
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ProtocolError> {
    writer.write_all(&with_length_prefix(body)?).await?;
    writer.flush().await?;
    Ok(())
}
