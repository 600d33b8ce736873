//! Protocol message definitions.
//!
//! Uses serde's internally-tagged representation: each message is an
//! object with a `"type"` field (e.g. `{"type": "request-start", ...}`).
//! Field names are camelCase on the wire. The `chunk` field is special:
//! the JSON codec carries it base64-encoded inside the object, the
//! binary codec strips it from the header and appends the raw bytes.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All messages exchanged between server and client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    // ── Registration ────────────────────────────────────────────
    /// Claim a host for this connection (client → server).
    #[serde(rename_all = "camelCase")]
    Register {
        id: Uuid,
        api_key: String,
        domain: String,
    },

    /// Claim acknowledged (server → client); flips the client live.
    Registered { id: Uuid },

    // ── Tunnelled HTTP request (server → client) ────────────────
    /// Begin a tunnelled HTTP request.
    #[serde(rename_all = "camelCase")]
    RequestStart {
        id: Uuid,
        domain: String,
        method: String,
        url: String,
        headers: HashMap<String, String>,
        has_body: bool,
    },

    /// Next request body chunk; only sent when `has_body` was true.
    #[serde(rename_all = "camelCase")]
    RequestData {
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_chunk")]
        chunk: Option<Bytes>,
    },

    /// No more request body.
    RequestEnd { id: Uuid },

    /// The public caller went away; abort the local call.
    RequestAborted { id: Uuid },

    // ── Tunnelled HTTP response (client → server) ───────────────
    /// Begin the reply for a tunnelled request.
    #[serde(rename_all = "camelCase")]
    ResponseStart {
        id: Uuid,
        status: u16,
        status_text: String,
        headers: HashMap<String, String>,
    },

    /// Next response body chunk.
    #[serde(rename_all = "camelCase")]
    ResponseData {
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_chunk")]
        chunk: Option<Bytes>,
    },

    /// Reply complete.
    ResponseEnd { id: Uuid },

    /// The local call failed; the server answers 503 for this request.
    ResponseError { id: Uuid, reason: String },

    // ── Tunnelled WebSockets (both directions after open) ───────
    /// A public WebSocket upgrade was accepted for a claimed host.
    #[serde(rename_all = "camelCase")]
    WsOpened {
        ws_id: Uuid,
        url: String,
        headers: HashMap<String, String>,
    },

    /// One WebSocket frame, forwarded verbatim. `text` marks a UTF-8
    /// frame so the far side reconstructs the same frame type.
    #[serde(rename_all = "camelCase")]
    WsMessage {
        ws_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_chunk")]
        chunk: Option<Bytes>,
        text: bool,
    },

    /// Either end of the tunnelled WebSocket closed.
    #[serde(rename_all = "camelCase")]
    WsClosed { ws_id: Uuid },
}

impl Message {
    /// The request or WebSocket id this message belongs to.
    pub fn id(&self) -> Uuid {
        match self {
            Message::Register { id, .. }
            | Message::Registered { id }
            | Message::RequestStart { id, .. }
            | Message::RequestData { id, .. }
            | Message::RequestEnd { id }
            | Message::RequestAborted { id }
            | Message::ResponseStart { id, .. }
            | Message::ResponseData { id, .. }
            | Message::ResponseEnd { id }
            | Message::ResponseError { id, .. } => *id,
            Message::WsOpened { ws_id, .. }
            | Message::WsMessage { ws_id, .. }
            | Message::WsClosed { ws_id } => *ws_id,
        }
    }

    /// Detach the raw payload, if this message carries one. Used by the
    /// binary codec so the header serialises without the chunk.
    pub(crate) fn take_chunk(&mut self) -> Option<Bytes> {
        match self {
            Message::RequestData { chunk, .. }
            | Message::ResponseData { chunk, .. }
            | Message::WsMessage { chunk, .. } => chunk.take(),
            _ => None,
        }
    }

    /// Reattach a raw payload after decoding a binary envelope. Ignored
    /// for message types that carry no chunk.
    pub(crate) fn put_chunk(&mut self, bytes: Bytes) {
        match self {
            Message::RequestData { chunk, .. }
            | Message::ResponseData { chunk, .. }
            | Message::WsMessage { chunk, .. } => *chunk = Some(bytes),
            _ => {}
        }
    }
}

/// Base64 (de)serialisation for chunk payloads in the JSON codec.
mod b64_chunk {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunk: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match chunk {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        match encoded {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(|raw| Some(Bytes::from(raw)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
