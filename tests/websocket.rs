//! WebSocket upgrades spliced through the proxy.

mod common;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::Message;

use common::{next_event, start_proxy, start_websocket_echo, test_config};
use session_mitm::session::{SessionEvent, SessionOptions};

fn handshake(origin: std::net::SocketAddr, session_id: &str) -> http::Request<()> {
    let credentials = STANDARD.encode(format!("browser:{}", session_id));
    http::Request::builder()
        .uri(format!("ws://{}/chat", origin))
        .header("host", origin.to_string())
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", generate_key())
        .header("proxy-authorization", format!("Basic {}", credentials))
        .body(())
        .unwrap()
}

#[tokio::test]
async fn websocket_frames_are_spliced_to_the_origin() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.session("s1", SessionOptions::default()).await;
    let mut events = session.subscribe();
    let origin = start_websocket_echo().await;

    let request = handshake(origin, "s1");
    let mut correlation = HeaderMap::new();
    correlation.insert("host", request.headers()["host"].clone());
    correlation.insert("sec-websocket-key", request.headers()["sec-websocket-key"].clone());
    session.register_websocket_headers("browser-ws-1", &correlation);

    let stream = TcpStream::connect(("127.0.0.1", proxy.proxy.port())).await.unwrap();
    let (mut ws, response) = tokio::time::timeout(
        Duration::from_secs(5),
        tokio_tungstenite::client_async(request, stream),
    )
    .await
    .expect("handshake finished")
    .unwrap();
    assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);

    ws.send(Message::text("ping")).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_text().unwrap().as_str(), "ping");

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(&echoed.into_data()[..], &[1u8, 2, 3][..]);
    ws.close(None).await.unwrap();

    let upgraded = next_event(&mut events, |event| match event {
        SessionEvent::Response(resource) => Some(resource),
        _ => None,
    })
    .await;
    assert_eq!(upgraded.browser_request_id.as_deref(), Some("browser-ws-1"));
    assert_eq!(upgraded.protocol, "ws");
    assert_eq!(upgraded.response.as_ref().map(|r| r.status_code), Some(101));
}

#[tokio::test]
async fn uncorrelated_upgrades_fail() {
    let mut config = test_config();
    config.timeouts.websocket_correlation_ms = 200;
    let proxy = start_proxy(config).await;
    proxy.session("s1", SessionOptions::default()).await;
    let origin = start_websocket_echo().await;

    let stream = TcpStream::connect(("127.0.0.1", proxy.proxy.port())).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        tokio_tungstenite::client_async(handshake(origin, "s1"), stream),
    )
    .await
    .expect("handshake finished");
    assert!(result.is_err());
}

#[test]
fn handshake_carries_the_proxy_credential() {
    let request = handshake("127.0.0.1:9".parse().unwrap(), "abc");
    let value: &HeaderValue = &request.headers()["proxy-authorization"];
    assert_eq!(
        session_mitm::proxy::read_session_id(request.headers()).as_deref(),
        Some("abc")
    );
    assert!(value.to_str().unwrap().starts_with("Basic "));
}
