//! Client execution core.
//!
//! # Responsibilities
//! - Dial the server's connect path and negotiate the binary codec
//! - Claim a domain and surface the acknowledgement to the caller
//! - Replay tunnelled requests against the local address and stream
//!   the responses back
//!
//! # Design Decisions
//! - Every local call runs on its own task; the inbound loop only
//!   routes messages, so one slow local response never stalls others
//!   beyond the shared transport's back-pressure
//! - A connection that dies before `registered` arrives is reported as
//!   a rejection: the server closes silently on a bad api key

pub mod local;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::protocol::{Codec, Message, PROTOCOL_VERSION};
use crate::server::DEFAULT_CONNECT_PATH;
use crate::sync::{Channel, Signal};
use crate::transport::{self, socket, Duplex};

/// Request body chunks buffered before the local call must catch up.
const BODY_CAPACITY: usize = 32;
/// Frames buffered per tunnelled WebSocket.
const WS_STREAM_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server url must be http(s) or ws(s), got {0}")]
    UnsupportedScheme(String),
    #[error("websocket dial failed: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed before registration was acknowledged")]
    RegistrationRejected,
    #[error("connection closed")]
    ConnectionClosed,
}

/// How to reach the server and what to claim.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server base url, e.g. `http://tunnel.example:8080`.
    pub server: String,
    pub api_key: String,
    /// Domain to claim; inbound requests with this `Host` are ours.
    pub domain: String,
    /// Local base url requests are replayed against, e.g.
    /// `http://127.0.0.1:3000`.
    pub local_addr: String,
    /// Connect path on the server; defaults to `/_connect`.
    pub connect_path: Option<String>,
}

impl From<ClientConfig> for ConnectOptions {
    fn from(config: ClientConfig) -> Self {
        Self {
            server: config.server,
            api_key: config.api_key,
            domain: config.domain,
            local_addr: config.local_addr,
            connect_path: Some(config.connect_path),
        }
    }
}

/// A live tunnel, as handed to the caller.
pub struct Tunnel {
    registered: oneshot::Receiver<()>,
    closed: JoinHandle<Option<ClientError>>,
    control: Channel<Message>,
}

impl Tunnel {
    /// Resolves once the server has acknowledged the domain claim.
    pub async fn registered(&mut self) -> Result<(), ClientError> {
        (&mut self.registered)
            .await
            .map_err(|_| ClientError::RegistrationRejected)
    }

    /// Waits for the connection to end; `Some` carries the terminal
    /// error if the end was abnormal.
    pub async fn closed(self) -> Option<ClientError> {
        match self.closed.await {
            Ok(outcome) => outcome,
            Err(_) => Some(ClientError::ConnectionClosed),
        }
    }

    /// Hang up. In-flight local calls are cancelled.
    pub fn shutdown(&self) {
        self.control.close();
    }
}

/// Shared state for one client connection.
pub(crate) struct ClientState {
    pub local_addr: String,
    pub http: reqwest::Client,
    pub live: AtomicBool,
    pub requests: DashMap<Uuid, LocalCall>,
    pub ws_streams: DashMap<Uuid, Channel<Message>>,
    pub outgoing: Channel<Message>,
}

/// One tunnelled request being replayed locally.
pub(crate) struct LocalCall {
    /// Request body chunks, present when the request has a body.
    pub body: Option<Channel<Bytes>>,
    pub abort: Signal,
}

impl ClientState {
    fn fail_all(&self) {
        let ids: Vec<Uuid> = self.requests.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.requests.remove(&id) {
                call.abort.cancel();
                if let Some(body) = call.body {
                    body.close();
                }
            }
        }
        let ws_ids: Vec<Uuid> = self.ws_streams.iter().map(|entry| *entry.key()).collect();
        for ws_id in ws_ids {
            if let Some((_, stream)) = self.ws_streams.remove(&ws_id) {
                stream.close();
            }
        }
    }
}

/// Dial the server, claim the domain, and start serving tunnelled
/// requests in the background.
pub async fn connect(options: ConnectOptions) -> Result<Tunnel, ClientError> {
    let url = connect_url(&options)?;
    tracing::info!(
        server = %url,
        domain = %options.domain,
        local_addr = %options.local_addr,
        "dialling tunnel server"
    );

    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let duplex = transport::bind(socket::client_socket(socket), Codec::Binary);

    let state = Arc::new(ClientState {
        local_addr: options.local_addr.trim_end_matches('/').to_string(),
        http: reqwest::Client::new(),
        live: AtomicBool::new(false),
        requests: DashMap::new(),
        ws_streams: DashMap::new(),
        outgoing: duplex.outgoing.clone(),
    });

    duplex
        .outgoing
        .send(Message::Register {
            id: Uuid::new_v4(),
            api_key: options.api_key,
            domain: options.domain,
        })
        .await
        .map_err(|_| ClientError::ConnectionClosed)?;

    let (registered_tx, registered_rx) = oneshot::channel();
    let control = duplex.outgoing.clone();
    let closed = tokio::spawn(run(state, duplex, registered_tx));

    Ok(Tunnel {
        registered: registered_rx,
        closed,
        control,
    })
}

/// Build `ws(s)://…<connect_path>?v=<version>` from the server url.
fn connect_url(options: &ConnectOptions) -> Result<Url, ClientError> {
    let mut url = Url::parse(&options.server)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ClientError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::UnsupportedScheme(scheme.to_string()))?;
    let path = options
        .connect_path
        .as_deref()
        .unwrap_or(DEFAULT_CONNECT_PATH);
    url.set_path(path);
    url.set_query(Some(&format!("v={PROTOCOL_VERSION}")));
    Ok(url)
}

/// The inbound loop: route every server message until the transport
/// dies, then cancel all outstanding local work.
async fn run(
    state: Arc<ClientState>,
    duplex: Duplex,
    registered_tx: oneshot::Sender<()>,
) -> Option<ClientError> {
    let mut registered_tx = Some(registered_tx);
    while let Some(message) = duplex.incoming.recv().await {
        dispatch(&state, message, &mut registered_tx).await;
    }
    duplex.close();
    state.fail_all();

    if registered_tx.is_some() {
        tracing::warn!("connection closed before registration was acknowledged");
        Some(ClientError::RegistrationRejected)
    } else {
        tracing::info!("tunnel connection closed");
        None
    }
}

async fn dispatch(
    state: &Arc<ClientState>,
    message: Message,
    registered_tx: &mut Option<oneshot::Sender<()>>,
) {
    match message {
        Message::Registered { .. } => {
            if state.live.swap(true, Ordering::SeqCst) {
                tracing::debug!("duplicate registered acknowledgement");
            }
            if let Some(tx) = registered_tx.take() {
                let _ = tx.send(());
            }
            tracing::info!("domain claim acknowledged");
        }

        Message::RequestStart {
            id,
            method,
            url,
            headers,
            has_body,
            ..
        } => {
            let abort = Signal::new();
            let body = has_body.then(|| Channel::<Bytes>::new(BODY_CAPACITY));
            state.requests.insert(
                id,
                LocalCall {
                    body: body.clone(),
                    abort: abort.clone(),
                },
            );
            tracing::debug!(request_id = %id, method = %method, url = %url, "request received");
            tokio::spawn(local::execute(
                state.clone(),
                id,
                method,
                url,
                headers,
                body,
                abort,
            ));
        }

        Message::RequestData { id, chunk } => {
            let Some(chunk) = chunk else {
                tracing::warn!(request_id = %id, "request-data without chunk");
                return;
            };
            let Some((body, abort)) = state.requests.get(&id).and_then(|call| {
                call.body
                    .clone()
                    .map(|body| (body, call.abort.clone()))
            }) else {
                tracing::warn!(request_id = %id, "request-data for unknown request");
                return;
            };
            tokio::select! {
                result = body.send(chunk) => {
                    if result.is_err() {
                        tracing::debug!(request_id = %id, "local call no longer reading its body");
                    }
                }
                _ = abort.cancelled() => {}
            }
        }

        Message::RequestEnd { id } => {
            match state.requests.get(&id) {
                Some(call) => {
                    if let Some(body) = &call.body {
                        body.close();
                    }
                }
                None => {
                    tracing::warn!(request_id = %id, "request-end for unknown request");
                }
            }
        }

        Message::RequestAborted { id } => {
            if let Some((_, call)) = state.requests.remove(&id) {
                tracing::debug!(request_id = %id, "request aborted by caller");
                call.abort.cancel();
                if let Some(body) = call.body {
                    body.close();
                }
            }
        }

        Message::WsOpened { ws_id, url, .. } => {
            // Register the stream before any dial so frames arriving
            // right behind ws-opened are not dropped.
            let stream: Channel<Message> = Channel::new(WS_STREAM_CAPACITY);
            state.ws_streams.insert(ws_id, stream.clone());
            tokio::spawn(local::run_local_websocket(state.clone(), ws_id, url, stream));
        }

        message @ (Message::WsMessage { .. } | Message::WsClosed { .. }) => {
            let ws_id = message.id();
            let Some(stream) = state
                .ws_streams
                .get(&ws_id)
                .map(|entry| entry.value().clone())
            else {
                tracing::warn!(ws_id = %ws_id, "frame for unknown tunnelled websocket");
                return;
            };
            let _ = stream.send(message).await;
        }

        other => {
            tracing::warn!(message = ?other, "unexpected message from server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(server: &str) -> ConnectOptions {
        ConnectOptions {
            server: server.to_string(),
            api_key: "key".into(),
            domain: "app.test".into(),
            local_addr: "http://127.0.0.1:3000".into(),
            connect_path: None,
        }
    }

    #[test]
    fn connect_url_upgrades_scheme_and_sets_version() {
        let url = connect_url(&options("http://tunnel.example:8080")).unwrap();
        assert_eq!(url.as_str(), "ws://tunnel.example:8080/_connect?v=2");

        let url = connect_url(&options("https://tunnel.example")).unwrap();
        assert_eq!(url.as_str(), "wss://tunnel.example/_connect?v=2");
    }

    #[test]
    fn connect_url_respects_custom_path() {
        let mut opts = options("http://tunnel.example");
        opts.connect_path = Some("/warp".into());
        let url = connect_url(&opts).unwrap();
        assert_eq!(url.as_str(), "ws://tunnel.example/warp?v=2");
    }

    #[test]
    fn connect_url_rejects_unknown_scheme() {
        let err = connect_url(&options("ftp://tunnel.example")).unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedScheme(_)));
    }
}
