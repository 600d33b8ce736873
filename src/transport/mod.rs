//! Duplex transport: one WebSocket bound to a pair of channels.
//!
//! # Responsibilities
//! - Decode every inbound frame and deliver it on the `incoming` channel
//! - Encode every value taken from the `outgoing` channel and transmit it
//! - Close both channels exactly once when the socket dies, and close
//!   the socket when either channel is closed
//!
//! # Design Decisions
//! - The binding is generic over a frame-level Stream + Sink, so the
//!   axum server socket and the tungstenite client socket share one
//!   pump implementation
//! - Undecodable frames are logged and dropped; they never terminate
//!   the connection
//! - Channel capacity is the only flow control added here; the rest is
//!   whatever the socket itself provides

pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;

use crate::protocol::{Codec, Message, WireFrame};
use crate::sync::Channel;

/// In-flight frames tolerated per direction before back-pressure.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server socket error: {0}")]
    Server(#[from] axum::Error),
    #[error("client socket error: {0}")]
    Client(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Both directions of one connection, already framed and decoded.
pub struct Duplex {
    pub incoming: Channel<Message>,
    pub outgoing: Channel<Message>,
    closer: Arc<Closer>,
}

struct Closer {
    incoming: Channel<Message>,
    outgoing: Channel<Message>,
    closing: AtomicBool,
}

impl Closer {
    fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.incoming.close();
            self.outgoing.close();
            tracing::debug!("transport closed");
        }
    }
}

impl Duplex {
    /// Close both channels; the pump tasks then drop the socket.
    /// Idempotent.
    pub fn close(&self) {
        self.closer.close();
    }

    /// Fires when the transport has closed, whichever side initiated.
    pub fn signal(&self) -> crate::sync::Signal {
        self.incoming.signal()
    }
}

/// Bind an open socket to an `incoming`/`outgoing` channel pair using
/// the negotiated codec. Spawns the two pump tasks; they run until the
/// socket or either channel closes.
pub fn bind<S>(socket: S, codec: Codec) -> Duplex
where
    S: Stream<Item = Result<WireFrame, TransportError>>
        + Sink<WireFrame, Error = TransportError>
        + Send
        + 'static,
{
    let incoming: Channel<Message> = Channel::new(CHANNEL_CAPACITY);
    let outgoing: Channel<Message> = Channel::new(CHANNEL_CAPACITY);
    let closer = Arc::new(Closer {
        incoming: incoming.clone(),
        outgoing: outgoing.clone(),
        closing: AtomicBool::new(false),
    });

    let (mut sink, mut stream) = socket.split();

    let reader_closer = closer.clone();
    let reader_incoming = incoming.clone();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(WireFrame::Close) => break,
                Ok(frame) => match codec.decode(frame) {
                    Ok(message) => {
                        if reader_incoming.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable frame");
                    }
                },
                Err(err) => {
                    tracing::debug!(error = %err, "socket read ended");
                    break;
                }
            }
        }
        reader_closer.close();
    });

    let writer_closer = closer.clone();
    let writer_outgoing = outgoing.clone();
    tokio::spawn(async move {
        while let Some(message) = writer_outgoing.recv().await {
            let frame = match codec.encode(message) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unencodable message");
                    continue;
                }
            };
            if let Err(err) = sink.send(frame).await {
                tracing::debug!(error = %err, "socket write ended");
                break;
            }
        }
        let _ = sink.send(WireFrame::Close).await;
        let _ = sink.close().await;
        writer_closer.close();
    });

    Duplex {
        incoming,
        outgoing,
        closer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;
    use uuid::Uuid;

    async fn paired_sockets() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (left, right) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(left, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(right, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn messages_cross_the_transport_in_order() {
        let (server_ws, client_ws) = paired_sockets().await;
        let server = bind(socket::client_socket(server_ws), Codec::Binary);
        let client = bind(socket::client_socket(client_ws), Codec::Binary);

        let id = Uuid::new_v4();
        for index in 0..5u8 {
            client
                .outgoing
                .send(Message::RequestData {
                    id,
                    chunk: Some(Bytes::from(vec![index])),
                })
                .await
                .unwrap();
        }
        client.outgoing.send(Message::RequestEnd { id }).await.unwrap();

        for index in 0..5u8 {
            let message = server.incoming.recv().await.unwrap();
            assert_eq!(
                message,
                Message::RequestData {
                    id,
                    chunk: Some(Bytes::from(vec![index])),
                }
            );
        }
        assert_eq!(
            server.incoming.recv().await,
            Some(Message::RequestEnd { id })
        );
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_other() {
        let (server_ws, client_ws) = paired_sockets().await;
        let server = bind(socket::client_socket(server_ws), Codec::Json);
        let client = bind(socket::client_socket(client_ws), Codec::Json);

        client.close();

        // The server's inbound loop observes clean termination.
        assert_eq!(server.incoming.recv().await, None);
        assert!(client.incoming.is_closed());
        assert!(client.outgoing.is_closed());
    }
}
