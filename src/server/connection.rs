//! Per-client connection state and the inbound dispatch loop.
//!
//! # Responsibilities
//! - Track a connected client: claimed hosts, in-flight requests,
//!   tunnelled WebSocket streams
//! - Dispatch every message the client sends: registration, response
//!   assembly, upstream WebSocket frames
//! - Tear everything down when the transport dies: pending requests
//!   resolve 503, body channels close, host claims are released
//!
//! # Design Decisions
//! - All reads for one connection happen on this loop; all writes go
//!   through the outbound channel, so they are serialised without locks
//! - Protocol violations (unknown ids, wrong-direction messages) are
//!   logged and dropped; they never kill the connection
//! - DashMap guards are never held across an await; handles are cloned
//!   out first

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocket;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::{Codec, Message};
use crate::server::Gateway;
use crate::sync::{Channel, SendError, Signal};
use crate::transport::{self, socket};

/// Body chunks buffered per request before the consumer must catch up.
const BODY_CAPACITY: usize = 32;

/// How a tunnelled request's response future resolves.
pub(crate) enum Reply {
    /// `response-start` arrived; stream the body from the request's
    /// body channel.
    Streaming {
        status: u16,
        headers: HashMap<String, String>,
    },
    /// The request cannot be served; answer with a fixed 503 text.
    Unavailable(&'static str),
}

/// Server-side state for one in-flight tunnelled request.
pub(crate) struct OngoingRequest {
    /// One-shot slot the public handler is awaiting. Taken on
    /// `response-start` or failure.
    pub reply: Option<oneshot::Sender<Reply>>,
    /// Response body chunks, fed by `response-data`.
    pub body: Channel<Bytes>,
    /// Fires when the public caller goes away.
    pub abort: Signal,
    /// Fires when the entry is removed, releasing the abort watcher.
    pub done: Signal,
}

impl OngoingRequest {
    pub fn new(reply: oneshot::Sender<Reply>) -> Self {
        Self {
            reply: Some(reply),
            body: Channel::new(BODY_CAPACITY),
            abort: Signal::new(),
            done: Signal::new(),
        }
    }
}

/// One connected client, as the server sees it.
pub(crate) struct ClientConnection {
    pub id: Uuid,
    outgoing: Channel<Message>,
    pub requests: DashMap<Uuid, OngoingRequest>,
    /// Tunnelled WebSocket streams: ws id → channel feeding the public
    /// socket task.
    pub ws_streams: DashMap<Uuid, Channel<Message>>,
    /// Hosts this connection has claimed, for reverse cleanup.
    pub hosts: Mutex<Vec<String>>,
}

impl ClientConnection {
    fn new(outgoing: Channel<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outgoing,
            requests: DashMap::new(),
            ws_streams: DashMap::new(),
            hosts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a message for the client. Fails once the transport died.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        self.outgoing.send(message).await
    }

    /// Fires when the transport has died and sends can no longer
    /// succeed.
    pub fn closed_signal(&self) -> Signal {
        self.outgoing.signal()
    }

    /// Remove a request entry, closing its body channel and releasing
    /// its abort watcher. Returns the entry so the caller can resolve
    /// the reply slot.
    pub fn remove_request(&self, id: &Uuid) -> Option<OngoingRequest> {
        let (_, entry) = self.requests.remove(id)?;
        entry.body.close();
        entry.done.cancel();
        Some(entry)
    }

    /// Resolve every pending request with 503 and close every body and
    /// tunnelled WebSocket channel. Called once on teardown.
    fn fail_all(&self) {
        let ids: Vec<Uuid> = self.requests.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(mut entry) = self.remove_request(&id) {
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(Reply::Unavailable(super::NO_REGISTRATION));
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

/// Run one client connection to completion: bind the transport,
/// dispatch inbound messages, tear down on exit.
pub(crate) async fn run(gateway: Arc<Gateway>, socket: WebSocket, codec: Codec) {
    let duplex = transport::bind(socket::server_socket(socket), codec);
    let connection = Arc::new(ClientConnection::new(duplex.outgoing.clone()));
    gateway
        .connections
        .insert(connection.id, connection.clone());
    tracing::info!(
        connection_id = %connection.id,
        codec = ?codec,
        "client connected"
    );

    while let Some(message) = duplex.incoming.recv().await {
        if let ControlFlow::Break(()) = dispatch(&gateway, &connection, message).await {
            break;
        }
    }

    duplex.close();
    gateway.connections.remove(&connection.id);
    let hosts = connection
        .hosts
        .lock()
        .expect("host list mutex poisoned")
        .clone();
    let released = gateway.registry.release(&hosts, connection.id);
    connection.fail_all();
    tracing::info!(
        connection_id = %connection.id,
        released_hosts = released,
        "client disconnected"
    );
}

/// Handle one inbound message. `Break` tears the connection down.
async fn dispatch(
    gateway: &Arc<Gateway>,
    connection: &Arc<ClientConnection>,
    message: Message,
) -> ControlFlow<()> {
    match message {
        Message::Register {
            id,
            api_key,
            domain,
        } => register(gateway, connection, id, api_key, domain).await,

        Message::ResponseStart {
            id,
            status,
            headers,
            ..
        } => {
            let Some(mut entry) = connection.requests.get_mut(&id) else {
                tracing::warn!(request_id = %id, "response-start for unknown request");
                return ControlFlow::Continue(());
            };
            match entry.reply.take() {
                Some(reply) => {
                    let _ = reply.send(Reply::Streaming { status, headers });
                }
                None => {
                    tracing::warn!(request_id = %id, "duplicate response-start");
                }
            }
            ControlFlow::Continue(())
        }

        Message::ResponseData { id, chunk } => {
            let Some(chunk) = chunk else {
                tracing::warn!(request_id = %id, "response-data without chunk");
                return ControlFlow::Continue(());
            };
            // Clone handles out; holding the guard across the send
            // would block the whole map.
            let Some((body, abort)) = connection
                .requests
                .get(&id)
                .map(|entry| (entry.body.clone(), entry.abort.clone()))
            else {
                tracing::warn!(request_id = %id, "response-data for unknown request");
                return ControlFlow::Continue(());
            };
            tokio::select! {
                result = body.send(chunk) => {
                    if result.is_err() {
                        tracing::debug!(request_id = %id, "response body reader went away");
                    }
                }
                _ = abort.cancelled() => {}
            }
            ControlFlow::Continue(())
        }

        Message::ResponseEnd { id } => {
            if connection.remove_request(&id).is_none() {
                tracing::warn!(request_id = %id, "response-end for unknown request");
            }
            ControlFlow::Continue(())
        }

        Message::ResponseError { id, reason } => {
            tracing::warn!(request_id = %id, reason = %reason, "client reported request failure");
            match connection.remove_request(&id) {
                Some(mut entry) => {
                    if let Some(reply) = entry.reply.take() {
                        let _ = reply.send(Reply::Unavailable(super::REMOTE_FAILED));
                    }
                }
                None => {
                    tracing::warn!(request_id = %id, "response-error for unknown request");
                }
            }
            ControlFlow::Continue(())
        }

        message @ (Message::WsMessage { .. } | Message::WsClosed { .. }) => {
            let ws_id = message.id();
            let Some(stream) = connection
                .ws_streams
                .get(&ws_id)
                .map(|entry| entry.value().clone())
            else {
                tracing::warn!(ws_id = %ws_id, "frame for unknown tunnelled websocket");
                return ControlFlow::Continue(());
            };
            let _ = stream.send(message).await;
            ControlFlow::Continue(())
        }

        other => {
            tracing::warn!(message = ?other, "unexpected message from client");
            ControlFlow::Continue(())
        }
    }
}

async fn register(
    gateway: &Arc<Gateway>,
    connection: &Arc<ClientConnection>,
    id: Uuid,
    api_key: String,
    domain: String,
) -> ControlFlow<()> {
    if !gateway.api_keys.iter().any(|key| *key == api_key) {
        tracing::warn!(
            connection_id = %connection.id,
            domain = %domain,
            "registration rejected: unknown api key"
        );
        // Close without a reply; the client sees the transport die.
        return ControlFlow::Break(());
    }

    let displaced = gateway.registry.register(&domain, connection.id);
    if let Some(previous) = displaced {
        tracing::info!(
            domain = %domain,
            previous_connection = %previous,
            connection_id = %connection.id,
            "host claim displaced"
        );
    } else {
        tracing::info!(
            domain = %domain,
            connection_id = %connection.id,
            "host claimed"
        );
    }
    connection
        .hosts
        .lock()
        .expect("host list mutex poisoned")
        .push(domain.to_ascii_lowercase());

    if connection.send(Message::Registered { id }).await.is_err() {
        return ControlFlow::Break(());
    }
    ControlFlow::Continue(())
}
