//! Message codecs.
//!
//! Two interchangeable encodings over the same envelope shape:
//!
//! - **JSON**: the whole message as a JSON text frame, chunk payloads
//!   base64-encoded in place. The legacy encoding every client speaks.
//! - **Binary**: `[u32-le header_len][header JSON without chunk]
//!   [chunk bytes]` as a binary frame, skipping base64 on the hot path.
//!
//! Clients that declare a protocol version on the upgrade URL get the
//! binary envelope; absent means JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::message::Message;

/// Version the client declares via the `v` query parameter.
pub const PROTOCOL_VERSION: &str = "2";

/// One WebSocket frame, abstracted away from any particular socket
/// library. Transport adapters convert to and from this.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
    /// Close notification; carries no payload the core cares about.
    Close,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message header: {0}")]
    Header(#[from] serde_json::Error),
    #[error("binary envelope truncated ({0} bytes)")]
    Truncated(usize),
    #[error("frame type does not match negotiated codec")]
    FrameType,
}

/// Which encoding a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Binary,
}

impl Codec {
    /// Pick the codec from the `v` query parameter of the upgrade URL.
    pub fn negotiate(version: Option<&str>) -> Self {
        match version {
            Some(_) => Codec::Binary,
            None => Codec::Json,
        }
    }

    pub fn encode(&self, mut message: Message) -> Result<WireFrame, CodecError> {
        match self {
            Codec::Json => Ok(WireFrame::Text(serde_json::to_string(&message)?)),
            Codec::Binary => {
                let chunk = message.take_chunk();
                let header = serde_json::to_vec(&message)?;
                let chunk_len = chunk.as_ref().map(Bytes::len).unwrap_or(0);
                let mut envelope = BytesMut::with_capacity(4 + header.len() + chunk_len);
                envelope.put_u32_le(header.len() as u32);
                envelope.put_slice(&header);
                if let Some(chunk) = chunk {
                    envelope.put_slice(&chunk);
                }
                Ok(WireFrame::Binary(envelope.freeze()))
            }
        }
    }

    pub fn decode(&self, frame: WireFrame) -> Result<Message, CodecError> {
        match (self, frame) {
            (Codec::Json, WireFrame::Text(text)) => Ok(serde_json::from_str(&text)?),
            (Codec::Binary, WireFrame::Binary(mut envelope)) => {
                if envelope.len() < 4 {
                    return Err(CodecError::Truncated(envelope.len()));
                }
                let header_len = envelope.get_u32_le() as usize;
                if envelope.len() < header_len {
                    return Err(CodecError::Truncated(envelope.len()));
                }
                let header = envelope.split_to(header_len);
                let mut message: Message = serde_json::from_slice(&header)?;
                if !envelope.is_empty() {
                    message.put_chunk(envelope);
                }
                Ok(message)
            }
            _ => Err(CodecError::FrameType),
        }
    }
}
