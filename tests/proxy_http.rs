//! Plain HTTP traffic through the proxy: attribution, forwarding, events,
//! interception, caching and socket reuse.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};

use common::{
    closed_port, next_event, raw_connect, start_origin, start_proxy, start_stale_keep_alive_origin, test_config, text,
    OriginKind,
};
use session_mitm::session::{
    InterceptHandler, InterceptRequest, InterceptRule, InterceptedResponse, SessionEvent, SessionOptions,
    SessionState,
};

#[tokio::test]
async fn requests_without_credentials_get_407() {
    let proxy = start_proxy(test_config()).await;
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "hi") }).await;

    let client = proxy.client_builder(None).build().unwrap();
    let response = client.get(origin.http_url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert!(response.headers().contains_key("proxy-authenticate"));
    assert!(origin.requests().is_empty());
}

#[tokio::test]
async fn connect_without_credentials_gets_407() {
    let proxy = start_proxy(test_config()).await;
    proxy.session("s1", SessionOptions::default()).await;
    let origin = start_origin(OriginKind::TlsHttp1, |_| async { text(StatusCode::OK, "hi") }).await;

    let (_, head) = raw_connect(proxy.proxy.port(), origin.addr, None).await;
    assert!(head.starts_with("HTTP/1.1 407"), "unexpected reply: {head}");
    assert!(head.to_ascii_lowercase().contains("proxy-authenticate: basic"));
    assert_eq!(proxy.proxy.active_tunnels(), 0);
    assert_eq!(origin.connections(), 0);
}

#[tokio::test]
async fn unknown_session_gets_504() {
    let proxy = start_proxy(test_config()).await;
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "hi") }).await;

    let response = proxy.client("ghost").get(origin.http_url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(origin.requests().is_empty());
}

#[tokio::test]
async fn plain_request_is_forwarded_and_reported() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.session("s1", SessionOptions::default()).await;
    let mut events = session.subscribe();
    let origin = start_origin(OriginKind::Plain, |_| async {
        let mut response = text(StatusCode::OK, "hello world");
        response
            .headers_mut()
            .insert("x-origin", HeaderValue::from_static("yes"));
        response
    })
    .await;

    let url = origin.http_url("/page?q=1");
    let response = proxy.client("s1").get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-origin"], "yes");
    assert_eq!(response.text().await.unwrap(), "hello world");

    let seen = origin.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uri, "/page?q=1");
    assert!(!seen[0].headers.contains_key("proxy-authorization"));
    assert_eq!(seen[0].headers["host"], origin.addr.to_string().as_str());

    let request = next_event(&mut events, |event| match event {
        SessionEvent::Request(resource) => Some(resource),
        _ => None,
    })
    .await;
    assert_eq!(request.url, url);
    assert_eq!(request.request.method, "GET");

    let completed = next_event(&mut events, |event| match event {
        SessionEvent::Response(resource) => Some(resource),
        _ => None,
    })
    .await;
    let response = completed.response.as_ref().expect("response details");
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body_bytes, "hello world".len());
    assert!(!completed.was_intercepted);
    assert!(completed.socket_id.is_some());
}

#[tokio::test]
async fn request_body_and_status_are_forwarded() {
    let proxy = start_proxy(test_config()).await;
    proxy.session("s1", SessionOptions::default()).await;
    let origin = start_origin(OriginKind::Plain, |request| async move {
        let mut response = http::Response::new(http_body_util::Full::new(request.body));
        *response.status_mut() = StatusCode::CREATED;
        response
    })
    .await;

    let response = proxy
        .client("s1")
        .post(origin.http_url("/items"))
        .json(&serde_json::json!({ "name": "widget" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["name"], "widget");
    assert_eq!(origin.requests()[0].method, http::Method::POST);
}

#[tokio::test]
async fn bypass_session_answers_with_an_empty_document() {
    let proxy = start_proxy(test_config()).await;
    let options = SessionOptions {
        bypass_all_with_empty_response: true,
        ..SessionOptions::default()
    };
    proxy.session("bypass", options).await;
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "real") }).await;

    let response = proxy.client("bypass").get(origin.http_url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(
        response.text().await.unwrap(),
        session_mitm::handlers::http_request::EMPTY_HTML
    );
    assert!(origin.requests().is_empty());
}

#[tokio::test]
async fn blocked_urls_get_an_empty_404() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.session("s1", SessionOptions::default()).await;
    session.add_intercept_rule(InterceptRule::new().with_url("*/ads/*").unwrap());
    let mut events = session.subscribe();
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "real") }).await;

    let client = proxy.client("s1");
    let blocked = client.get(origin.http_url("/ads/banner.js")).send().await.unwrap();
    assert_eq!(blocked.status(), StatusCode::NOT_FOUND);
    assert!(blocked.text().await.unwrap().is_empty());

    let intercepted = next_event(&mut events, |event| match event {
        SessionEvent::Response(resource) => Some(resource),
        _ => None,
    })
    .await;
    assert!(intercepted.was_intercepted);

    let allowed = client.get(origin.http_url("/app.js")).send().await.unwrap();
    assert_eq!(allowed.text().await.unwrap(), "real");
    let seen = origin.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uri, "/app.js");
}

struct MockApi;

#[async_trait]
impl InterceptHandler for MockApi {
    async fn handle(&self, request: InterceptRequest<'_>) -> Option<InterceptedResponse> {
        (request.url.path() == "/api/user").then(|| {
            InterceptedResponse::new(StatusCode::OK, r#"{"name":"mock"}"#)
                .with_header(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        })
    }
}

#[tokio::test]
async fn intercept_handlers_supply_responses() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.session("s1", SessionOptions::default()).await;
    session.add_intercept_rule(
        InterceptRule::new()
            .with_url("*/api/*")
            .unwrap()
            .with_handler(Arc::new(MockApi)),
    );
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "real") }).await;

    let client = proxy.client("s1");
    let mocked = client.get(origin.http_url("/api/user")).send().await.unwrap();
    assert_eq!(mocked.status(), StatusCode::OK);
    assert_eq!(mocked.headers()["content-type"], "application/json");
    assert_eq!(mocked.text().await.unwrap(), r#"{"name":"mock"}"#);

    // Matched but unanswered: blocked.
    let unanswered = client.get(origin.http_url("/api/other")).send().await.unwrap();
    assert_eq!(unanswered.status(), StatusCode::NOT_FOUND);
    assert!(origin.requests().is_empty());
}

#[tokio::test]
async fn etag_responses_are_revalidated_and_replayed() {
    let mut config = test_config();
    config.cache.enabled = true;
    let proxy = start_proxy(config).await;
    proxy.session("s1", SessionOptions::default()).await;
    let origin = start_origin(OriginKind::Plain, |request| async move {
        if request.headers.get("if-none-match").is_some_and(|v| v == "\"v1\"") {
            return text(StatusCode::NOT_MODIFIED, "");
        }
        let mut response = text(StatusCode::OK, "cached body");
        response.headers_mut().insert("etag", HeaderValue::from_static("\"v1\""));
        response
    })
    .await;

    let client = proxy.client("s1");
    let url = origin.http_url("/style.css");
    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.text().await.unwrap(), "cached body");
    // The entry is stored once the first response ends.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.text().await.unwrap(), "cached body");

    let seen = origin.requests();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].headers.get("if-none-match").is_none());
    assert_eq!(seen[1].headers["if-none-match"], "\"v1\"");
}

#[tokio::test]
async fn keep_alive_sockets_are_reused() {
    let proxy = start_proxy(test_config()).await;
    proxy.session("s1", SessionOptions::default()).await;
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "ok") }).await;

    let client = proxy.client("s1");
    for _ in 0..3 {
        let response = client.get(origin.http_url("/")).send().await.unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(origin.requests().len(), 3);
    assert_eq!(origin.connections(), 1);
}

#[tokio::test]
async fn stale_keep_alive_sockets_are_retried_on_a_new_socket() {
    let proxy = start_proxy(test_config()).await;
    proxy.session("s1", SessionOptions::default()).await;
    let (origin, connections) = start_stale_keep_alive_origin().await;

    let client = proxy.client("s1");
    let url = format!("http://{}/", origin);
    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.text().await.unwrap(), "ok");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the pooled socket takes the request, then the origin hangs up on it
    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.text().await.unwrap(), "ok");
    assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sockets_per_origin_are_capped() {
    let mut config = test_config();
    config.pool.max_connections_per_origin = 2;
    let proxy = start_proxy(config).await;
    proxy.session("s1", SessionOptions::default()).await;
    let origin = start_origin(OriginKind::Plain, |_| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        text(StatusCode::OK, "slow")
    })
    .await;

    let client = proxy.client("s1");
    let requests = (0..6).map(|i| {
        let client = client.clone();
        let url = origin.http_url(&format!("/{}", i));
        async move { client.get(url).send().await.unwrap().text().await.unwrap() }
    });
    let bodies = futures_util::future::join_all(requests).await;
    assert!(bodies.iter().all(|body| body == "slow"));
    assert_eq!(origin.requests().len(), 6);
    assert!(origin.peak_connections() <= 2, "peak {}", origin.peak_connections());
}

#[tokio::test]
async fn unreachable_origins_answer_504_with_an_error_event() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.session("s1", SessionOptions::default()).await;
    let mut events = session.subscribe();
    let port = closed_port().await;

    let response = proxy
        .client("s1")
        .get(format!("http://127.0.0.1:{}/", port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = response.text().await.unwrap();
    assert!(body.contains("ProxyToServer.RequestError"), "body: {}", body);

    let kind = next_event(&mut events, |event| match event {
        SessionEvent::HttpError { kind, .. } => Some(kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, "ProxyToServer.RequestError");
}

#[tokio::test]
async fn default_session_claims_unauthenticated_traffic() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.register("default", SessionOptions::default(), true).await;
    let origin = start_origin(OriginKind::Plain, |_| async { text(StatusCode::OK, "isolated") }).await;

    let client = proxy.client_builder(None).build().unwrap();
    let response = client.get(origin.http_url("/")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "isolated");

    // Closing the default session takes the proxy down with it.
    session.close().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !proxy.proxy.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("proxy closed");
}

#[tokio::test]
async fn closed_sessions_are_forgotten() {
    let proxy = start_proxy(test_config()).await;
    let session = proxy.session("short-lived", SessionOptions::default()).await;
    assert!(proxy.proxy.session("short-lived").is_some());

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(proxy.proxy.session("short-lived").is_none());
    assert!(!proxy.proxy.is_closed());
}

#[tokio::test]
async fn closing_the_proxy_closes_its_sessions() {
    let proxy = start_proxy(test_config()).await;
    let first = proxy.session("a", SessionOptions::default()).await;
    let second = proxy.session("b", SessionOptions::default()).await;

    proxy.proxy.close().await;
    assert!(proxy.proxy.is_closed());
    assert_eq!(first.state(), SessionState::Closed);
    assert_eq!(second.state(), SessionState::Closed);
}
