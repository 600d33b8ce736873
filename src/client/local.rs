//! Replaying tunnelled traffic against the local address.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use url::Url;
use uuid::Uuid;

use crate::client::ClientState;
use crate::protocol::Message;
use crate::sync::{link, Channel, Signal};

/// Response bodies are re-chunked so one frame never exceeds this.
const MAX_CHUNK: usize = 64 * 1024;

/// Run one tunnelled request end to end: call the local app, stream
/// the reply back, report failure as `response-error`.
pub(crate) async fn execute(
    state: Arc<ClientState>,
    id: Uuid,
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Option<Channel<Bytes>>,
    abort: Signal,
) {
    // One stop handle for every wait below: fires on request abort or
    // on the transport dying.
    let stop = link([abort, state.outgoing.signal()]);
    match call_local(&state, &method, &url, headers, body, &stop).await {
        Ok(Some(response)) => stream_response(&state, id, response, &stop).await,
        Ok(None) => {
            tracing::debug!(request_id = %id, "local call cancelled");
        }
        Err(err) => {
            tracing::warn!(request_id = %id, error = %err, "local call failed");
            let _ = state
                .outgoing
                .send(Message::ResponseError {
                    id,
                    reason: err.to_string(),
                })
                .await;
        }
    }
    state.requests.remove(&id);
}

/// Issue the local HTTP call. `Ok(None)` means the request was stopped
/// before the local app answered.
async fn call_local(
    state: &ClientState,
    method: &str,
    url: &str,
    headers: HashMap<String, String>,
    body: Option<Channel<Bytes>>,
    stop: &Signal,
) -> Result<Option<reqwest::Response>, reqwest::Error> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let target = format!("{}{}", state.local_addr, url);

    let mut request = state.http.request(method, &target);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(chunks) = body {
        let cancel = stop.clone();
        let stream = futures_util::stream::unfold(
            (chunks, cancel),
            |(chunks, cancel)| async move {
                chunks
                    .recv_cancel(&cancel)
                    .await
                    .map(|chunk| (Ok::<_, io::Error>(chunk), (chunks, cancel)))
            },
        );
        request = request.body(reqwest::Body::wrap_stream(stream));
    }

    tokio::select! {
        result = request.send() => result.map(Some),
        _ = stop.cancelled() => Ok(None),
    }
}

/// Stream the local response back as response-start/data/end.
async fn stream_response(
    state: &ClientState,
    id: Uuid,
    response: reqwest::Response,
    stop: &Signal,
) {
    let status = response.status();
    let start = Message::ResponseStart {
        id,
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers: flatten_headers(response.headers()),
    };
    if state.outgoing.send(start).await.is_err() {
        return;
    }

    let mut stream = response.bytes_stream();
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = stop.cancelled() => return,
        };
        match item {
            Some(Ok(mut chunk)) => {
                while !chunk.is_empty() {
                    let piece = chunk.split_to(chunk.len().min(MAX_CHUNK));
                    let message = Message::ResponseData {
                        id,
                        chunk: Some(piece),
                    };
                    let sent = tokio::select! {
                        result = state.outgoing.send(message) => result.is_ok(),
                        _ = stop.cancelled() => false,
                    };
                    if !sent {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                tracing::warn!(request_id = %id, error = %err, "local response stream failed");
                let _ = state
                    .outgoing
                    .send(Message::ResponseError {
                        id,
                        reason: err.to_string(),
                    })
                    .await;
                return;
            }
            None => {
                let _ = state.outgoing.send(Message::ResponseEnd { id }).await;
                tracing::debug!(request_id = %id, "response complete");
                return;
            }
        }
    }
}

fn flatten_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

/// Dial the local app's WebSocket endpoint and pump frames both ways.
pub(crate) async fn run_local_websocket(
    state: Arc<ClientState>,
    ws_id: Uuid,
    url: String,
    inbound: Channel<Message>,
) {
    let target = match local_ws_url(&state.local_addr, &url) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(ws_id = %ws_id, error = %err, "bad local websocket url");
            state.ws_streams.remove(&ws_id);
            let _ = state.outgoing.send(Message::WsClosed { ws_id }).await;
            return;
        }
    };

    let socket = match tokio_tungstenite::connect_async(target.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            tracing::warn!(ws_id = %ws_id, error = %err, "local websocket dial failed");
            state.ws_streams.remove(&ws_id);
            let _ = state.outgoing.send(Message::WsClosed { ws_id }).await;
            return;
        }
    };
    tracing::debug!(ws_id = %ws_id, target = %target, "local websocket open");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => {
                let outbound = match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => Some(Message::WsMessage {
                        ws_id,
                        chunk: Some(Bytes::from(text.to_string())),
                        text: true,
                    }),
                    Some(Ok(tungstenite::Message::Binary(bytes))) => Some(Message::WsMessage {
                        ws_id,
                        chunk: Some(bytes),
                        text: false,
                    }),
                    Some(Ok(
                        tungstenite::Message::Ping(_)
                        | tungstenite::Message::Pong(_)
                        | tungstenite::Message::Frame(_),
                    )) => None,
                    Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => {
                        let _ = state.outgoing.send(Message::WsClosed { ws_id }).await;
                        break;
                    }
                };
                if let Some(message) = outbound {
                    if state.outgoing.send(message).await.is_err() {
                        break;
                    }
                }
            }
            message = inbound.recv() => {
                match message {
                    Some(Message::WsMessage { chunk: Some(chunk), text, .. }) => {
                        let frame = if text {
                            match String::from_utf8(chunk.to_vec()) {
                                Ok(text) => tungstenite::Message::Text(text.into()),
                                Err(_) => tungstenite::Message::Binary(chunk),
                            }
                        } else {
                            tungstenite::Message::Binary(chunk)
                        };
                        if sink.send(frame).await.is_err() {
                            let _ = state.outgoing.send(Message::WsClosed { ws_id }).await;
                            break;
                        }
                    }
                    Some(Message::WsClosed { .. }) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }
    state.ws_streams.remove(&ws_id);
}

/// `http://local` + `/path?query` → `ws://local/path?query`.
fn local_ws_url(local_addr: &str, url: &str) -> Result<Url, url::ParseError> {
    let base = Url::parse(local_addr)?;
    let mut target = base.join(url)?;
    let scheme = match target.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let _ = target.set_scheme(scheme);
    Ok(target)
}
