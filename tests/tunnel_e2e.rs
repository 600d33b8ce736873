//! End-to-end tests: a real tunnel server, real clients, and a mock
//! local app, all over loopback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::routing::{get, post};
use axum::Router;
use reqwest::header::HOST;
use reqwest::StatusCode;

use warp_tunnel::protocol::Message;
use warp_tunnel::{connect, ConnectOptions};

mod common;

const NO_REGISTRATION: &str = "No registration for domain and/or remote service not available";

fn options(server: std::net::SocketAddr, domain: &str, local: std::net::SocketAddr) -> ConnectOptions {
    ConnectOptions {
        server: format!("http://{server}"),
        api_key: "test-key".to_string(),
        domain: domain.to_string(),
        local_addr: format!("http://{local}"),
        connect_path: None,
    }
}

#[tokio::test]
async fn happy_path_get() {
    let local = common::serve_router(Router::new().route("/", get(|| async { "hi" }))).await;
    let server = common::start_tunnel_server(&["test-key"]).await;

    let mut tunnel = connect(options(server, "app.test", local)).await.unwrap();
    tunnel.registered().await.unwrap();

    let response = common::http_client()
        .get(format!("http://{server}/"))
        .header(HOST, "app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn streamed_upload_preserves_chunk_order() {
    let local = common::serve_router(
        Router::new().route("/upload", post(|body: Bytes| async move { body })),
    )
    .await;
    let server = common::start_tunnel_server(&["test-key"]).await;

    let mut tunnel = connect(options(server, "up.test", local)).await.unwrap();
    tunnel.registered().await.unwrap();

    let chunks = futures_util::stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"A")),
        Ok(Bytes::from_static(b"B")),
        Ok(Bytes::from_static(b"C")),
    ]);
    let response = common::http_client()
        .post(format!("http://{server}/upload"))
        .header(HOST, "up.test")
        .body(reqwest::Body::wrap_stream(chunks))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ABC");
}

#[tokio::test]
async fn caller_abort_cancels_the_local_call() {
    let entered = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::new(AtomicBool::new(false));

    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let local = {
        let entered = entered.clone();
        let cancelled = cancelled.clone();
        common::serve_router(
            Router::new()
                .route("/", get(|| async { "hi" }))
                .route(
                    "/hang",
                    get(move || {
                        let entered = entered.clone();
                        let cancelled = cancelled.clone();
                        async move {
                            let _flag = DropFlag(cancelled);
                            entered.store(true, Ordering::SeqCst);
                            std::future::pending::<()>().await;
                            String::new()
                        }
                    }),
                ),
        )
        .await
    };
    let server = common::start_tunnel_server(&["test-key"]).await;

    let mut tunnel = connect(options(server, "abort.test", local)).await.unwrap();
    tunnel.registered().await.unwrap();

    let caller = {
        let client = common::http_client();
        let url = format!("http://{server}/hang");
        tokio::spawn(async move { client.get(url).header(HOST, "abort.test").send().await })
    };

    // Wait for the request to reach the local app, then hang up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !entered.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "request never reached the local app"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    caller.abort();

    // The abort propagates through the tunnel and the local handler is
    // dropped.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cancelled.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "local call was never cancelled"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The connection survives and keeps serving.
    let response = common::http_client()
        .get(format!("http://{server}/"))
        .header(HOST, "abort.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn unknown_host_gets_503() {
    let server = common::start_tunnel_server(&["test-key"]).await;

    let response = common::http_client()
        .get(format!("http://{server}/"))
        .header(HOST, "nope.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().await.unwrap(), NO_REGISTRATION);
}

#[tokio::test]
async fn rejected_api_key_closes_without_acknowledgement() {
    let server = common::start_tunnel_server(&["test-key"]).await;
    let local: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();

    let mut options = options(server, "app.test", local);
    options.api_key = "wrong-key".to_string();

    let mut tunnel = connect(options).await.unwrap();
    assert!(tunnel.registered().await.is_err());
}

#[tokio::test]
async fn connection_loss_during_response_truncates_cleanly() {
    let server = common::start_tunnel_server(&["test-key"]).await;
    let raw = common::RawClient::connect(server, "test-key", "drop.test").await;

    let caller = {
        let client = common::http_client();
        let url = format!("http://{server}/");
        tokio::spawn(async move { client.get(url).header(HOST, "drop.test").send().await })
    };

    let Some(Message::RequestStart { id, has_body, .. }) = raw.next().await else {
        panic!("expected request-start");
    };
    assert!(!has_body);
    assert_eq!(raw.next().await, Some(Message::RequestEnd { id }));

    raw.duplex
        .outgoing
        .send(Message::ResponseStart {
            id,
            status: 200,
            status_text: "OK".to_string(),
            headers: Default::default(),
        })
        .await
        .unwrap();
    raw.duplex
        .outgoing
        .send(Message::ResponseData {
            id,
            chunk: Some(Bytes::from_static(b"partial")),
        })
        .await
        .unwrap();

    // Disconnect without response-end.
    raw.duplex.close();

    let response = caller.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"partial"));

    // Teardown also released the host claim.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = common::http_client()
            .get(format!("http://{server}/"))
            .header(HOST, "drop.test")
            .send()
            .await
            .unwrap();
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "host claim was never released"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn tunnelled_websocket_round_trips_frames() {
    use axum::extract::ws::WebSocketUpgrade;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite;
    use tungstenite::client::IntoClientRequest;

    let local = common::serve_router(Router::new().route(
        "/echo",
        get(|ws: WebSocketUpgrade| async move {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(message)) = socket.recv().await {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
            })
        }),
    ))
    .await;
    let server = common::start_tunnel_server(&["test-key"]).await;

    let mut tunnel = connect(options(server, "ws.test", local)).await.unwrap();
    tunnel.registered().await.unwrap();

    let mut request = format!("ws://{server}/echo").into_client_request().unwrap();
    request.headers_mut().insert(
        tungstenite::http::header::HOST,
        tungstenite::http::HeaderValue::from_static("ws.test"),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    socket
        .send(tungstenite::Message::Text("ping".into()))
        .await
        .unwrap();

    let reply = loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for the echoed frame");
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => break text.to_string(),
            Some(Ok(_)) => continue,
            other => panic!("unexpected websocket frame: {other:?}"),
        }
    };
    assert_eq!(reply, "ping");

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn later_registration_displaces_earlier_one() {
    let local_a = common::serve_router(Router::new().route("/", get(|| async { "from-a" }))).await;
    let local_b = common::serve_router(Router::new().route("/", get(|| async { "from-b" }))).await;
    let server = common::start_tunnel_server(&["test-key"]).await;

    let mut tunnel_a = connect(options(server, "x.test", local_a)).await.unwrap();
    tunnel_a.registered().await.unwrap();
    let mut tunnel_b = connect(options(server, "x.test", local_b)).await.unwrap();
    tunnel_b.registered().await.unwrap();

    let body = common::http_client()
        .get(format!("http://{server}/"))
        .header(HOST, "x.test")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "from-b");

    // The displaced connection going away must not remove the claim.
    tunnel_a.shutdown();
    assert!(tunnel_a.closed().await.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body = common::http_client()
        .get(format!("http://{server}/"))
        .header(HOST, "x.test")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "from-b");
}
