//! Shared utilities for the proxy integration tests.
//!
//! Origins are small hyper servers (plain, TLS over HTTP/1.1, TLS over h2)
//! that record every request they see. Clients are reqwest clients pointed
//! at the proxy with a session id in their Basic proxy credential.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use session_mitm::cache::ResponseCache;
use session_mitm::config::ProxyConfig;
use session_mitm::proxy::{CertificateAuthority, MitmProxy};
use session_mitm::session::{RequestSession, SessionEvent, SessionOptions};

/// What an origin saw of one request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Handler = Arc<dyn Fn(RecordedRequest) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync>;

/// A running mock origin.
#[derive(Clone)]
pub struct Origin {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    connections: Arc<AtomicUsize>,
    open_connections: Arc<AtomicUsize>,
    peak_connections: Arc<AtomicUsize>,
}

impl Origin {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.peak_connections.load(Ordering::SeqCst)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn https_url(&self, path: &str) -> String {
        format!("https://{}{}", self.addr, path)
    }
}

/// Which protocol an origin speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    Plain,
    TlsHttp1,
    TlsHttp2,
}

pub fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Starts an origin answering every request with `handler`.
pub async fn start_origin<F, Fut>(kind: OriginKind, handler: F) -> Origin
where
    F: Fn(RecordedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let handler: Handler = Arc::new(move |request| -> BoxFuture<'static, Response<Full<Bytes>>> {
        Box::pin(handler(request))
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = Origin {
        addr: listener.local_addr().unwrap(),
        requests: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
        open_connections: Arc::new(AtomicUsize::new(0)),
        peak_connections: Arc::new(AtomicUsize::new(0)),
    };
    let acceptor = match kind {
        OriginKind::Plain => None,
        OriginKind::TlsHttp1 => Some(origin_tls_acceptor(&[b"http/1.1"])),
        OriginKind::TlsHttp2 => Some(origin_tls_acceptor(&[b"h2", b"http/1.1"])),
    };

    let state = origin.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            let state = state.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                state.connections.fetch_add(1, Ordering::SeqCst);
                let open = state.open_connections.fetch_add(1, Ordering::SeqCst) + 1;
                state.peak_connections.fetch_max(open, Ordering::SeqCst);
                match acceptor {
                    None => serve(stream, false, handler, &state).await,
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
                            serve(tls, h2, handler, &state).await;
                        }
                    }
                }
                state.open_connections.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });
    origin
}

async fn serve<IO>(io: IO, h2: bool, handler: Handler, origin: &Origin)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let requests = Arc::clone(&origin.requests);
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let requests = Arc::clone(&requests);
        async move {
            let (parts, body) = request.into_parts();
            let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
            let recorded = RecordedRequest {
                method: parts.method,
                uri: parts.uri.to_string(),
                version: parts.version,
                headers: parts.headers,
                body,
            };
            requests.lock().unwrap().push(recorded.clone());
            Ok::<_, Infallible>(handler(recorded).await)
        }
    });
    if h2 {
        let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(io), service)
            .await;
    } else {
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await;
    }
}

fn origin_tls_acceptor(alpn: &[&[u8]]) -> tokio_rustls::TlsAcceptor {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string(), "localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert.der().to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

/// Plain keep-alive origin whose first connection answers one request,
/// reads the next one and hangs up without answering. Later connections
/// answer every request with `ok`. Returns the address and a connection count.
pub async fn start_stale_keep_alive_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut served = 0;
                while read_request_head(&mut stream).await.is_some() {
                    served += 1;
                    if index == 0 && served == 2 {
                        return;
                    }
                    let answer = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok";
                    if stream.write_all(answer).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, connections)
}

/// Reads one bodiless request or response head. `None` on EOF.
pub async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(_) => return None,
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// Sends a raw `CONNECT` to the proxy and returns the stream with the reply head.
pub async fn raw_connect(proxy_port: u16, target: SocketAddr, session_id: Option<&str>) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(id) = session_id {
        let credentials = STANDARD.encode(format!("browser:{}", id));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = tokio::time::timeout(Duration::from_secs(5), read_request_head(&mut stream))
        .await
        .expect("CONNECT answered")
        .expect("CONNECT reply head");
    (stream, head)
}

/// TLS h2 origin built on the raw `h2` server so it can push.
///
/// `/page` pushes `/style.css` as a bodiless 304 carrying ETag `"v1"`, then
/// answers `page` after a short pause. Any other path answers `css-body`
/// with the same ETag.
pub async fn start_push_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = Origin {
        addr: listener.local_addr().unwrap(),
        requests: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
        open_connections: Arc::new(AtomicUsize::new(0)),
        peak_connections: Arc::new(AtomicUsize::new(0)),
    };
    let acceptor = origin_tls_acceptor(&[b"h2"]);
    let state = origin.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let state = state.clone();
            tokio::spawn(async move {
                state.connections.fetch_add(1, Ordering::SeqCst);
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let Ok(mut connection) = h2::server::handshake(tls).await else {
                    return;
                };
                while let Some(Ok((request, respond))) = connection.accept().await {
                    state.requests.lock().unwrap().push(RecordedRequest {
                        method: request.method().clone(),
                        uri: request.uri().to_string(),
                        version: request.version(),
                        headers: request.headers().clone(),
                        body: Bytes::new(),
                    });
                    tokio::spawn(answer_with_push(request.uri().path().to_string(), state.addr, respond));
                }
            });
        }
    });
    origin
}

async fn answer_with_push(path: String, addr: SocketAddr, mut respond: h2::server::SendResponse<Bytes>) {
    if path == "/page" {
        let promised = Request::get(format!("https://{}/style.css", addr)).body(()).unwrap();
        if let Ok(mut pushed) = respond.push_request(promised) {
            let not_modified = Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header("etag", "\"v1\"")
                .body(())
                .unwrap();
            let _ = pushed.send_response(not_modified, true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Ok(mut body) = respond.send_response(Response::new(()), false) {
            let _ = body.send_data(Bytes::from_static(b"page"), true);
        }
    } else {
        let response = Response::builder()
            .header("etag", "\"v1\"")
            .header("content-type", "text/css")
            .body(())
            .unwrap();
        if let Ok(mut body) = respond.send_response(response, false) {
            let _ = body.send_data(Bytes::from_static(b"css-body"), true);
        }
    }
}

/// Reads an h2 body to the end, releasing flow-control capacity as it goes.
pub async fn read_h2_body(mut body: h2::RecvStream) -> Bytes {
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    Bytes::from(collected)
}

/// Starts a WebSocket origin that echoes every text and binary message.
pub async fn start_websocket_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Proxy under test plus the authority its leaf certificates chain to.
pub struct TestProxy {
    pub proxy: MitmProxy,
    pub authority: Arc<CertificateAuthority>,
    pub config: ProxyConfig,
    pub cache: Option<ResponseCache>,
}

pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.upstream.allow_insecure = true;
    config.timeouts.connect_ms = 2_000;
    config.timeouts.pool_wait_ms = 5_000;
    config.timeouts.websocket_correlation_ms = 2_000;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let authority = Arc::new(CertificateAuthority::generate().unwrap());
    let proxy = MitmProxy::start(&config.listener, authority.clone()).await.unwrap();
    let cache = config.cache.enabled.then(ResponseCache::new);
    TestProxy {
        proxy,
        authority,
        config,
        cache,
    }
}

impl TestProxy {
    pub async fn session(&self, id: &str, options: SessionOptions) -> Arc<RequestSession> {
        self.register(id, options, false).await
    }

    pub async fn register(&self, id: &str, options: SessionOptions, is_default: bool) -> Arc<RequestSession> {
        let session = RequestSession::new(id, options, &self.config, self.cache.clone())
            .await
            .unwrap();
        self.proxy.register_session(Arc::clone(&session), is_default);
        session
    }

    pub fn proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.proxy.port())
    }

    /// A client whose traffic is attributed to `session_id`.
    pub fn client(&self, session_id: &str) -> reqwest::Client {
        self.client_builder(Some(session_id)).build().unwrap()
    }

    pub fn client_builder(&self, session_id: Option<&str>) -> reqwest::ClientBuilder {
        let mut proxy = reqwest::Proxy::all(self.proxy_url()).unwrap();
        if let Some(id) = session_id {
            proxy = proxy.basic_auth("browser", id);
        }
        reqwest::Client::builder()
            .proxy(proxy)
            .tls_built_in_root_certs(false)
            .add_root_certificate(reqwest::Certificate::from_pem(self.authority.cert_pem().as_bytes()).unwrap())
            .timeout(Duration::from_secs(10))
    }
}

impl TestProxy {
    /// A raw h2 client with server push enabled, tunnelled to `target` for `session_id`.
    pub async fn h2_push_client(&self, session_id: &str, target: SocketAddr) -> h2::client::SendRequest<Bytes> {
        let (tunnel, head) = raw_connect(self.proxy.port(), target, Some(session_id)).await;
        assert!(head.starts_with("HTTP/1.1 200"), "CONNECT refused: {head}");

        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.authority.cert_der().clone()).unwrap();
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        let server_name = ServerName::try_from(target.ip().to_string()).unwrap();
        let tls = tokio_rustls::TlsConnector::from(Arc::new(config))
            .connect(server_name, tunnel)
            .await
            .unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

        let (client, connection) = h2::client::Builder::new()
            .enable_push(true)
            .handshake::<_, Bytes>(tls)
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });
        client
    }
}

/// Waits for the next event `select` accepts, skipping the rest.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut select: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = select(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a session event")
}

/// A local port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
