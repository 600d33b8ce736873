//! Server routing core.
//!
//! # Responsibilities
//! - Accept client connections on the connect path and run their
//!   dispatch loops
//! - Route every other request by `Host` to the owning client
//! - Pump request bodies out, assemble streamed responses back
//! - Forward public WebSocket upgrades through the tunnel
//!
//! # Design Decisions
//! - Each call to [`handler`] yields fresh routing state; nothing is
//!   process-global, so one process can embed several independent
//!   tunnel servers
//! - The public caller's disappearance is detected by drop: a guard on
//!   the handler future and on the response body stream fires the
//!   request's abort signal, which a detached watcher turns into a
//!   best-effort `request-aborted`

pub mod connection;
pub mod registry;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, HttpBody};
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::protocol::{Codec, Message};
use crate::server::connection::{ClientConnection, OngoingRequest, Reply};
use crate::server::registry::HostRegistry;
use crate::sync::{link, Channel, Signal};

pub const DEFAULT_CONNECT_PATH: &str = "/_connect";

pub(crate) const NO_REGISTRATION: &str =
    "No registration for domain and/or remote service not available";
pub(crate) const REMOTE_FAILED: &str = "Error sending request to remote client";

/// Frames buffered per tunnelled WebSocket before back-pressure.
const WS_STREAM_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// Options for building an embeddable tunnel handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// API keys accepted at registration time.
    pub api_keys: Vec<String>,
    /// Where clients dial in; defaults to [`DEFAULT_CONNECT_PATH`].
    pub connect_path: Option<String>,
}

/// Shared routing state. One per handler instance, never global.
pub(crate) struct Gateway {
    pub registry: HostRegistry,
    pub connections: DashMap<Uuid, Arc<ClientConnection>>,
    pub api_keys: Vec<String>,
}

/// Build the tunnel server as an axum [`Router`], embeddable in any
/// axum host.
pub fn handler(options: HandlerOptions) -> Router {
    let gateway = Arc::new(Gateway {
        registry: HostRegistry::new(),
        connections: DashMap::new(),
        api_keys: options.api_keys,
    });
    let connect_path = options
        .connect_path
        .unwrap_or_else(|| DEFAULT_CONNECT_PATH.to_string());

    Router::new()
        .route(&connect_path, any(connect_handler))
        .fallback(public_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Bind and run a tunnel server until the shutdown signal fires.
pub async fn serve(config: ServerConfig, shutdown: &Shutdown) -> Result<(), ServeError> {
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .map_err(ServeError::Bind)?;
    let address = listener.local_addr().map_err(ServeError::Bind)?;
    tracing::info!(
        address = %address,
        connect_path = %config.connect_path,
        api_keys = config.api_keys.len(),
        "tunnel server starting"
    );

    let app = handler(HandlerOptions {
        api_keys: config.api_keys,
        connect_path: Some(config.connect_path),
    });

    let stop = shutdown.signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
        })
        .await
        .map_err(ServeError::Serve)?;

    tracing::info!("tunnel server stopped");
    Ok(())
}

#[derive(Deserialize)]
struct ConnectQuery {
    v: Option<String>,
}

/// `GET <connect_path>`: upgrade and run the client dispatch loop.
async fn connect_handler(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response<Body> {
    let codec = Codec::negotiate(query.v.as_deref());
    ws.on_upgrade(move |socket| connection::run(gateway, socket, codec))
}

/// Every non-connect request: route by `Host` through the tunnel.
async fn public_handler(
    State(gateway): State<Arc<Gateway>>,
    request: Request<Body>,
) -> Response<Body> {
    let Some(host) = request_host(&request) else {
        return unavailable();
    };
    let Some(connection) = gateway
        .registry
        .lookup(&host)
        .and_then(|id| gateway.connections.get(&id).map(|entry| entry.value().clone()))
    else {
        tracing::debug!(host = %host, "no live registration for host");
        return unavailable();
    };

    if is_websocket_upgrade(request.headers()) {
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => tunnel_websocket(connection, upgrade, &parts),
            Err(rejection) => rejection.into_response(),
        };
    }
    tunnel_request(connection, host, request).await
}

fn is_websocket_upgrade(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn unavailable() -> Response<Body> {
    (StatusCode::SERVICE_UNAVAILABLE, NO_REGISTRATION).into_response()
}

/// `Host` header (port stripped), falling back to the URI authority.
fn request_host(request: &Request<Body>) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))?;
    let host = raw
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(host, _)| host.to_string())
        .unwrap_or(raw);
    Some(host)
}

fn flatten_headers(headers: &header::HeaderMap) -> std::collections::HashMap<String, String> {
    let mut flat = std::collections::HashMap::new();
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

/// Forward one ordinary HTTP request and await its streamed reply.
async fn tunnel_request(
    connection: Arc<ClientConnection>,
    host: String,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let has_body = !body.is_end_stream();
    let id = Uuid::new_v4();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let (reply_tx, reply_rx) = oneshot::channel();
    let ongoing = OngoingRequest::new(reply_tx);
    let abort = ongoing.abort.clone();
    let done = ongoing.done.clone();
    let body_channel = ongoing.body.clone();
    connection.requests.insert(id, ongoing);

    // Outlives this handler: turns a caller abort into request-aborted
    // even after the response has started streaming.
    tokio::spawn(watch_abort(connection.clone(), id, abort.clone(), done));

    tracing::debug!(
        request_id = %id,
        host = %host,
        method = %parts.method,
        url = %url,
        has_body,
        "tunnelling request"
    );

    let start = Message::RequestStart {
        id,
        domain: host,
        method: parts.method.to_string(),
        url,
        headers: flatten_headers(&parts.headers),
        has_body,
    };
    if connection.send(start).await.is_err() {
        connection.remove_request(&id);
        return unavailable();
    }

    let mut guard = AbortGuard::armed(abort.clone());

    if has_body {
        // The pump stops on caller abort or on the transport dying.
        let stop = link([abort.clone(), connection.closed_signal()]);
        tokio::spawn(pump_request_body(connection.clone(), id, body, stop));
    } else if connection.send(Message::RequestEnd { id }).await.is_err() {
        guard.disarm();
        connection.remove_request(&id);
        return unavailable();
    }

    match reply_rx.await {
        Ok(Reply::Streaming { status, headers }) => {
            // Abort tracking moves into the response body stream.
            guard.disarm();
            let mut response = Response::new(Body::from_stream(TunnelBody::new(
                body_channel,
                abort,
            )));
            *response.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            for (name, value) in &headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    response.headers_mut().append(name, value);
                }
            }
            response
        }
        Ok(Reply::Unavailable(text)) => {
            guard.disarm();
            (StatusCode::SERVICE_UNAVAILABLE, text).into_response()
        }
        Err(_) => {
            guard.disarm();
            unavailable()
        }
    }
}

async fn watch_abort(connection: Arc<ClientConnection>, id: Uuid, abort: Signal, done: Signal) {
    tokio::select! {
        _ = abort.cancelled() => {
            if connection.remove_request(&id).is_some() {
                tracing::debug!(request_id = %id, "public caller aborted");
                let _ = connection.send(Message::RequestAborted { id }).await;
            }
        }
        _ = done.cancelled() => {}
    }
}

/// Stream the public request body through as request-data messages.
async fn pump_request_body(
    connection: Arc<ClientConnection>,
    id: Uuid,
    body: Body,
    stop: Signal,
) {
    let mut stream = body.into_data_stream();
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = stop.cancelled() => return,
        };
        match item {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                let message = Message::RequestData {
                    id,
                    chunk: Some(chunk),
                };
                let sent = tokio::select! {
                    result = connection.send(message) => result.is_ok(),
                    _ = stop.cancelled() => false,
                };
                if !sent {
                    return;
                }
            }
            Some(Err(err)) => {
                tracing::warn!(request_id = %id, error = %err, "request body read failed");
                if let Some(mut entry) = connection.remove_request(&id) {
                    if let Some(reply) = entry.reply.take() {
                        let _ = reply.send(Reply::Unavailable(REMOTE_FAILED));
                    }
                }
                return;
            }
            None => {
                let _ = connection.send(Message::RequestEnd { id }).await;
                return;
            }
        }
    }
}

/// Cancels the request's abort signal when the public caller drops the
/// handler future before a response arrived.
struct AbortGuard {
    abort: Signal,
    armed: bool,
}

impl AbortGuard {
    fn armed(abort: Signal) -> Self {
        Self { abort, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed {
            self.abort.cancel();
        }
    }
}

/// Response body handed to the HTTP layer: drains the request's body
/// channel, and fires the abort signal if dropped before the channel
/// finished (the public caller went away mid-stream).
struct TunnelBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send + 'static>>,
    abort: Signal,
    finished: bool,
}

impl TunnelBody {
    fn new(chunks: Channel<Bytes>, abort: Signal) -> Self {
        let inner = futures_util::stream::unfold(chunks, |chunks| async move {
            chunks
                .recv()
                .await
                .map(|chunk| (Ok::<_, io::Error>(chunk), chunks))
        });
        Self {
            inner: Box::pin(inner),
            abort,
            finished: false,
        }
    }
}

impl Stream for TunnelBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.as_mut().poll_next(cx);
        if matches!(poll, Poll::Ready(None)) {
            self.finished = true;
        }
        poll
    }
}

impl Drop for TunnelBody {
    fn drop(&mut self) {
        if !self.finished {
            self.abort.cancel();
        }
    }
}

/// Forward a public WebSocket upgrade through the tunnel.
fn tunnel_websocket(
    connection: Arc<ClientConnection>,
    upgrade: WebSocketUpgrade,
    parts: &Parts,
) -> Response<Body> {
    let ws_id = Uuid::new_v4();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = flatten_headers(&parts.headers);
    upgrade.on_upgrade(move |socket| run_public_websocket(connection, ws_id, socket, url, headers))
}

/// Pump frames between the public socket and the tunnel until either
/// side closes.
async fn run_public_websocket(
    connection: Arc<ClientConnection>,
    ws_id: Uuid,
    socket: WebSocket,
    url: String,
    headers: std::collections::HashMap<String, String>,
) {
    let downstream: Channel<Message> = Channel::new(WS_STREAM_CAPACITY);
    connection.ws_streams.insert(ws_id, downstream.clone());
    tracing::debug!(ws_id = %ws_id, url = %url, "tunnelling websocket");

    if connection
        .send(Message::WsOpened {
            ws_id,
            url,
            headers,
        })
        .await
        .is_err()
    {
        connection.ws_streams.remove(&ws_id);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => {
                let outbound = match frame {
                    Some(Ok(ws::Message::Text(text))) => Some(Message::WsMessage {
                        ws_id,
                        chunk: Some(Bytes::from(text.to_string())),
                        text: true,
                    }),
                    Some(Ok(ws::Message::Binary(bytes))) => Some(Message::WsMessage {
                        ws_id,
                        chunk: Some(bytes),
                        text: false,
                    }),
                    Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => None,
                    Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => {
                        let _ = connection.send(Message::WsClosed { ws_id }).await;
                        break;
                    }
                };
                if let Some(message) = outbound {
                    if connection.send(message).await.is_err() {
                        break;
                    }
                }
            }
            inbound = downstream.recv() => {
                match inbound {
                    Some(Message::WsMessage { chunk: Some(chunk), text, .. }) => {
                        let frame = if text {
                            match String::from_utf8(chunk.to_vec()) {
                                Ok(text) => ws::Message::Text(text.into()),
                                Err(_) => ws::Message::Binary(chunk),
                            }
                        } else {
                            ws::Message::Binary(chunk)
                        };
                        if sink.send(frame).await.is_err() {
                            let _ = connection.send(Message::WsClosed { ws_id }).await;
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
    connection.ws_streams.remove(&ws_id);
}
