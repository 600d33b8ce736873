//! Frame adapters for the two socket libraries in play.
//!
//! The server receives upgraded sockets from axum, the client dials
//! with tokio-tungstenite. Both are mapped onto [`WireFrame`] so the
//! transport pump has one socket shape to deal with. Ping/pong frames
//! are left to each library's automatic handling.

use axum::extract::ws as server_ws;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite as client_ws;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::WireFrame;
use crate::transport::TransportError;

/// Adapt an axum upgrade socket to the frame-level interface.
pub fn server_socket(
    socket: server_ws::WebSocket,
) -> impl Stream<Item = Result<WireFrame, TransportError>>
       + Sink<WireFrame, Error = TransportError>
       + Send
       + 'static {
    socket
        .filter_map(|item| {
            future::ready(match item {
                Ok(message) => frame_from_server(message).map(Ok),
                Err(err) => Some(Err(TransportError::from(err))),
            })
        })
        .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(frame_to_server(frame))))
}

/// Adapt a tungstenite stream (client dial, or any raw socket in tests)
/// to the frame-level interface.
pub fn client_socket<S>(
    socket: WebSocketStream<S>,
) -> impl Stream<Item = Result<WireFrame, TransportError>>
       + Sink<WireFrame, Error = TransportError>
       + Send
       + 'static
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    socket
        .filter_map(|item| {
            future::ready(match item {
                Ok(message) => frame_from_client(message).map(Ok),
                Err(err) => Some(Err(TransportError::from(err))),
            })
        })
        .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(frame_to_client(frame))))
}

fn frame_from_server(message: server_ws::Message) -> Option<WireFrame> {
    match message {
        server_ws::Message::Text(text) => Some(WireFrame::Text(text.to_string())),
        server_ws::Message::Binary(bytes) => Some(WireFrame::Binary(bytes)),
        server_ws::Message::Close(_) => Some(WireFrame::Close),
        server_ws::Message::Ping(_) | server_ws::Message::Pong(_) => None,
    }
}

fn frame_to_server(frame: WireFrame) -> server_ws::Message {
    match frame {
        WireFrame::Text(text) => server_ws::Message::Text(text.into()),
        WireFrame::Binary(bytes) => server_ws::Message::Binary(bytes),
        WireFrame::Close => server_ws::Message::Close(None),
    }
}

fn frame_from_client(message: client_ws::Message) -> Option<WireFrame> {
    match message {
        client_ws::Message::Text(text) => Some(WireFrame::Text(text.to_string())),
        client_ws::Message::Binary(bytes) => Some(WireFrame::Binary(bytes)),
        client_ws::Message::Close(_) => Some(WireFrame::Close),
        client_ws::Message::Ping(_) | client_ws::Message::Pong(_) | client_ws::Message::Frame(_) => {
            None
        }
    }
}

fn frame_to_client(frame: WireFrame) -> client_ws::Message {
    match frame {
        WireFrame::Text(text) => client_ws::Message::Text(text.into()),
        WireFrame::Binary(bytes) => client_ws::Message::Binary(bytes),
        WireFrame::Close => client_ws::Message::Close(None),
    }
}
