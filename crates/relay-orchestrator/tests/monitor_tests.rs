//! Integration tests for the relay event link.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use relay_orchestrator::registry::monitor::{run_event_link, EVENT_SUBPROTOCOL};
use relay_orchestrator::registry::RelayInstance;
use relay_orchestrator::streams::StreamRepository;
use relay_test_utils::*;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

/// Accept one event-link connection, hold it until `close` fires, then close
/// it from the relay side.
async fn relay_event_endpoint() -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (close_tx, close_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let answer_subprotocol = |request: &Request, mut response: Response| {
            let offered = request
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            assert_eq!(offered, EVENT_SUBPROTOCOL);
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(EVENT_SUBPROTOCOL),
            );
            Ok::<Response, ErrorResponse>(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, answer_subprotocol)
            .await
            .unwrap();

        close_rx.await.unwrap();
        ws.close(None).await.unwrap();
    });

    (url, close_tx, server)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_event_link_marks_connected_then_down_on_close() {
    let (url, close, server) = relay_event_endpoint().await;
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, false), instance("h2", 50, true)]);
    let registry = registry_for(&store, &[instance_config("h1"), instance_config("h2")]);
    let alice = seed_user(&store, "alice").await;
    let pinned = seed_stream(&store, &alice, Some("h1")).await;

    let relay = RelayInstance {
        event_url: url,
        ..instance("h1", 10, false)
    };
    let cancel = CancellationToken::new();
    let link = tokio::spawn(run_event_link(
        registry,
        relay,
        Duration::from_secs(60),
        cancel.clone(),
    ));

    eventually("h1 marked connected", || {
        stored_registry(&store).get("h1").unwrap().connected
    })
    .await;
    let streams = StreamRepository::new(store.shared());
    assert_eq!(
        streams.load(pinned.id).await.unwrap().media_instance.as_deref(),
        Some("h1")
    );

    close.send(()).unwrap();
    eventually("h1 marked down", || {
        !stored_registry(&store).get("h1").unwrap().connected
    })
    .await;
    for _ in 0..400 {
        if streams.load(pinned.id).await.unwrap().media_instance.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(streams.load(pinned.id).await.unwrap().media_instance, None);
    assert!(stored_registry(&store).get("h2").unwrap().connected);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), link)
        .await
        .expect("event link should stop on cancel")
        .unwrap();
    server.await.unwrap();
}
