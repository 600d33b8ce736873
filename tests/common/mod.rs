//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use uuid::Uuid;

use warp_tunnel::protocol::{Codec, Message};
use warp_tunnel::server::{handler, HandlerOptions};
use warp_tunnel::transport::{bind, socket, Duplex};

/// Serve an axum router on an ephemeral loopback port.
pub async fn serve_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Start a tunnel server accepting the given api keys; returns its
/// public address.
pub async fn start_tunnel_server(api_keys: &[&str]) -> SocketAddr {
    serve_router(handler(HandlerOptions {
        api_keys: api_keys.iter().map(|key| key.to_string()).collect(),
        connect_path: None,
    }))
    .await
}

/// A hand-driven tunnel client speaking the wire protocol directly, for
/// tests that need to observe or script individual messages.
pub struct RawClient {
    pub duplex: Duplex,
}

impl RawClient {
    /// Dial, register, and wait for the acknowledgement.
    pub async fn connect(server: SocketAddr, api_key: &str, domain: &str) -> Self {
        let url = format!("ws://{server}/_connect?v=2");
        let (ws, _) = connect_async(&url).await.unwrap();
        let duplex = bind(socket::client_socket(ws), Codec::Binary);

        duplex
            .outgoing
            .send(Message::Register {
                id: Uuid::new_v4(),
                api_key: api_key.to_string(),
                domain: domain.to_string(),
            })
            .await
            .unwrap();

        let client = Self { duplex };
        match client.next().await {
            Some(Message::Registered { .. }) => {}
            other => panic!("expected registered acknowledgement, got {other:?}"),
        }
        client
    }

    /// Next inbound message, or `None` on connection close. Panics
    /// after five seconds; a stuck test should fail loudly.
    pub async fn next(&self) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(5), self.duplex.incoming.recv())
            .await
            .expect("timed out waiting for a tunnel message")
    }
}

/// A reqwest client that will not reuse pooled connections between
/// tests.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
