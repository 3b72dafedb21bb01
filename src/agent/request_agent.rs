//! The session-scoped request dispatcher.
//!
//! # Responsibilities
//! - Turn a request context into a live server socket via the origin's pool
//! - Prepare headers and run the session's before-request hooks
//! - Issue the request over HTTP/1.1 or a shared HTTP/2 session
//! - Retry once on a fresh socket when a reused socket dies before the write
//! - Decide whether a finished socket goes back to its pool
//!
//! # Data Flow
//! ```text
//! request(ctx)
//!     → GetSocket: pool(origin).get_socket(create_socket_connection)
//!         create: session.lookup_dns → SocketSession::connect → socket-connect event
//!     → CreateProxyToServerRequest: proxy-* stripped, Host injected (HTTP/1.1)
//!     → BeforeSendRequest: hooks
//!     → HTTP/1.1: ensure_http1 → send → (reused? probe, maybe retry once)
//!     → HTTP/2: CreateH2Session (shared per origin and per ip) → send_request
//!     → ServerRequest { response future, body sink }
//! free_socket(ctx) → pool.free_socket | socket.close
//! ```
//!
//! # Design Decisions
//! - The first live HTTP/2 session of an origin serves every request to it
//! - HTTP/2 session creation is serialized per origin; a racing spare socket is closed
//! - Hostnames that resolve to the same ip:port share a session when its certificate covers them

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Version};
use hyper::body::Incoming;

use super::binder::Http2SessionBinder;
use crate::config::TimeoutConfig;
use crate::context::{RequestContext, ResourceState};
use crate::error::{ProxyError, Result};
use crate::http::body::{self, FrameSender};
use crate::http::headers;
use crate::net::socket::Http1ResponseFuture;
use crate::net::{tls, ConnectOptions, MitmSocket, SocketSession, SocketSettings};
use crate::pool::{Http2Session, SocketPool};
use crate::session::{Http2ConnectSettings, RequestSession, SessionEvent};

/// A request on its way to the server.
///
/// The caller streams the client body into `body` (when present) and awaits `response`.
pub enum ServerRequest {
    Http1 {
        response: Http1ResponseFuture,
        body: Option<FrameSender>,
    },
    Http2 {
        response: h2::client::ResponseFuture,
        body: Option<h2::SendStream<Bytes>>,
    },
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRequest::Http1 { body, .. } => f
                .debug_struct("Http1")
                .field("has_body", &body.is_some())
                .finish(),
            ServerRequest::Http2 { body, .. } => f
                .debug_struct("Http2")
                .field("has_body", &body.is_some())
                .finish(),
        }
    }
}

/// Why a request on a reused socket is sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The connection would not take a request at all.
    NotWritable,
    /// The request came back unsent because the connection closed.
    ClosedBeforeWrite,
    /// Writing the request failed.
    FlushError,
    /// The server closed the connection inside the probe window.
    ReceivedEof,
}

pub struct RequestAgent {
    session_id: String,
    sockets: SocketSession,
    max_connections_per_origin: usize,
    pool_wait: Duration,
    reused_socket_probe: Duration,
    pools: DashMap<String, Arc<SocketPool>>,
    http2_by_ip: DashMap<SocketAddr, Vec<Http2Session>>,
    http2_connect: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RequestAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAgent")
            .field("session_id", &self.session_id)
            .field("pools", &self.pools.len())
            .field("max_connections_per_origin", &self.max_connections_per_origin)
            .finish()
    }
}

impl RequestAgent {
    pub fn new(
        session_id: impl Into<String>,
        settings: SocketSettings,
        upstream_proxy_url: Option<&str>,
        max_connections_per_origin: usize,
        timeouts: &TimeoutConfig,
    ) -> Result<Self> {
        let session_id = session_id.into();
        Ok(Self {
            sockets: SocketSession::new(session_id.clone(), settings, upstream_proxy_url)?,
            session_id,
            max_connections_per_origin: max_connections_per_origin.max(1),
            pool_wait: timeouts.pool_wait(),
            reused_socket_probe: timeouts.reused_socket_probe(),
            pools: DashMap::new(),
            http2_by_ip: DashMap::new(),
            http2_connect: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn max_connections_per_origin(&self) -> usize {
        self.max_connections_per_origin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The pool for `origin` (`host:port`), created on first use.
    pub fn pool(&self, origin: &str) -> Arc<SocketPool> {
        self.pools
            .entry(origin.to_string())
            .or_insert_with(|| SocketPool::new(origin, self.max_connections_per_origin, self.pool_wait))
            .clone()
    }

    /// Sends the request described by `ctx` to its server.
    pub async fn request(&self, ctx: &mut RequestContext) -> Result<ServerRequest> {
        if self.is_closed() || ctx.session.is_closing() {
            return Err(ProxyError::canceled("session closing"));
        }
        self.assign_socket(ctx, false).await?;

        ctx.set_state(ResourceState::CreateProxyToServerRequest);
        if ctx.is_server_http2 {
            headers::clean_proxy_headers(&mut ctx.request_headers);
        } else {
            headers::prepare_http1_request_headers(&mut ctx.request_headers, &ctx.url);
        }

        ctx.set_state(ResourceState::BeforeSendRequest);
        let session = Arc::clone(&ctx.session);
        session.before_http_request(ctx).await;

        if ctx.is_server_http2 {
            self.http2_request(ctx).await
        } else {
            self.http1_request(ctx).await
        }
    }

    /// Returns a finished exchange's socket to its pool, or closes it.
    pub fn free_socket(&self, ctx: &RequestContext) {
        let Some(socket) = ctx.socket.clone() else {
            return;
        };
        if ctx.is_upgrade || ctx.is_server_http2 || ctx.session.is_closing() {
            return;
        }
        let close_requested = headers::is_connection_close(&ctx.response_original_headers)
            || headers::is_connection_close(&ctx.request_headers);
        if close_requested || !socket.is_reusable() {
            socket.close();
            return;
        }
        socket.mark_reused();
        self.pool(&ctx.origin()).free_socket(socket);
    }

    /// Whether `host:port` negotiates HTTP/2. Shares one probe connection per origin.
    pub async fn is_host_alpn_h2(&self, session: &RequestSession, host: &str, port: u16) -> Result<bool> {
        let pool = self.pool(&format!("{}:{}", host, port));
        pool.is_http2(false, || self.create_socket_connection(session, host, port, true, false))
            .await
    }

    /// Closes every pool, socket and HTTP/2 session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in self.pools.iter() {
            pool.value().close();
        }
        self.http2_by_ip.clear();
        tracing::debug!(session_id = %self.session_id, pools = self.pools.len(), "Request agent closed");
    }

    async fn assign_socket(&self, ctx: &mut RequestContext, fresh: bool) -> Result<()> {
        ctx.set_state(ResourceState::GetSocket);
        let host = ctx
            .url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUrl(format!("no host in {}", ctx.url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = ctx
            .url
            .port_or_known_default()
            .unwrap_or_else(|| headers::default_port(ctx.url.scheme()));
        let is_ssl = matches!(ctx.url.scheme(), "https" | "wss");
        let is_websocket = ctx.is_websocket();
        let session = Arc::clone(&ctx.session);
        let pool = self.pool(&ctx.origin());

        let create = || self.create_socket_connection(&session, &host, port, is_ssl, is_websocket);
        let socket = if fresh {
            pool.get_fresh_socket(create).await?
        } else {
            pool.get_socket(is_websocket, create).await?
        };
        ctx.server_h2_session = pool
            .http2_session()
            .filter(|h2| h2.socket.id() == socket.id());
        ctx.assign_socket(socket);
        Ok(())
    }

    async fn create_socket_connection(
        &self,
        session: &RequestSession,
        host: &str,
        port: u16,
        is_ssl: bool,
        is_websocket: bool,
    ) -> Result<MitmSocket> {
        if self.is_closed() || session.is_closing() {
            return Err(ProxyError::canceled("session closing"));
        }
        let resolved_ip = session.lookup_dns(host).await;
        let socket = self
            .sockets
            .connect(ConnectOptions {
                host: host.to_string(),
                port,
                resolved_ip,
                is_ssl,
                is_websocket,
            })
            .await?;

        let info = socket.info().clone();
        session.emit(SessionEvent::SocketConnect(info.clone()));
        let mut closed = socket.subscribe_closed();
        let events = session.event_sender();
        tokio::spawn(async move {
            let _ = closed.wait_for(|closed| *closed).await;
            tracing::trace!(socket_id = %info.id, origin = %info.origin, "Server socket closed");
            let _ = events.send(SessionEvent::SocketClose(info));
        });
        Ok(socket)
    }

    async fn http1_request(&self, ctx: &mut RequestContext) -> Result<ServerRequest> {
        let mut retried = false;
        loop {
            let socket = ctx
                .socket
                .clone()
                .ok_or(ProxyError::SocketClosed("before http1 request"))?;
            let (request, body) = build_http1_request(ctx)?;
            let probe = socket.is_reused() && !retried;

            let sent = match socket.ensure_http1().await {
                Ok(()) => socket.send_http1(request).await,
                Err(error) => Err(error),
            };
            let outcome = match sent {
                Ok(response) if probe => probe_reused_socket(&socket, response, self.reused_socket_probe).await,
                Ok(response) => Ok(response),
                Err(error) if probe => {
                    tracing::trace!(socket_id = %socket.id(), %error, "Reused socket not writable");
                    Err(RetryReason::NotWritable)
                }
                Err(error) => return Err(error),
            };

            match outcome {
                Ok(response) => return Ok(ServerRequest::Http1 { response, body }),
                Err(reason) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        url = %ctx.url,
                        socket_id = %socket.id(),
                        ?reason,
                        "Reused socket failed before the request went out, retrying on a new socket"
                    );
                    socket.close();
                    retried = true;
                    self.assign_socket(ctx, true).await?;
                }
            }
        }
    }

    async fn http2_request(&self, ctx: &mut RequestContext) -> Result<ServerRequest> {
        let h2 = match ctx.server_h2_session.clone() {
            Some(h2) if !h2.is_closed() => h2,
            _ => self.create_http2_session(ctx).await?,
        };

        let mut request = Request::builder()
            .method(ctx.method.clone())
            .uri(ctx.url.as_str())
            .version(Version::HTTP_2)
            .body(())?;
        *request.headers_mut() = headers::prepare_http2_request_headers(&ctx.request_headers);

        let mut client = h2.client.clone().ready().await?;
        let end_of_stream = !ctx.has_request_body;
        let (response, stream) = client.send_request(request, end_of_stream)?;
        Ok(ServerRequest::Http2 {
            response,
            body: (!end_of_stream).then_some(stream),
        })
    }

    /// Finds or creates the HTTP/2 session for the context's socket.
    async fn create_http2_session(&self, ctx: &mut RequestContext) -> Result<Http2Session> {
        let origin = ctx.origin();
        let pool = self.pool(&origin);
        let gate = self
            .http2_connect
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _gate = gate.lock().await;

        let socket = ctx
            .socket
            .clone()
            .ok_or(ProxyError::SocketClosed("before h2 session"))?;

        if let Some(existing) = pool.http2_session() {
            if existing.socket.id() != socket.id() {
                socket.close();
            }
            self.use_http2_session(ctx, &existing);
            return Ok(existing);
        }

        let host = ctx.url.host_str().unwrap_or_default().to_string();
        if let Some(existing) = self.coalescable_session(&socket, &host) {
            tracing::debug!(
                session_id = %self.session_id,
                origin = %origin,
                shared_with = %existing.binder.origin(),
                "Sharing HTTP/2 session across hosts on one address"
            );
            socket.close();
            pool.register_http2_session(existing.clone());
            self.use_http2_session(ctx, &existing);
            return Ok(existing);
        }

        ctx.set_state(ResourceState::CreateH2Session);
        let mut settings = Http2ConnectSettings {
            enable_push: ctx.is_client_http2,
            ..Http2ConnectSettings::default()
        };
        let session = Arc::clone(&ctx.session);
        session.on_http2_session_connect(ctx, &mut settings).await;

        let mut builder = h2::client::Builder::new();
        builder.enable_push(settings.enable_push);
        if let Some(size) = settings.initial_window_size {
            builder.initial_window_size(size);
        }
        if let Some(size) = settings.initial_connection_window_size {
            builder.initial_connection_window_size(size);
        }
        if let Some(size) = settings.max_frame_size {
            builder.max_frame_size(size);
        }
        if let Some(max) = settings.max_concurrent_streams {
            builder.max_concurrent_streams(max);
        }
        if let Some(size) = settings.header_table_size {
            builder.header_table_size(size);
        }
        if let Some(size) = settings.max_header_list_size {
            builder.max_header_list_size(size);
        }

        let stream = socket
            .take_stream()
            .ok_or(ProxyError::SocketClosed("before h2 handshake"))?;
        let (client, mut connection) = builder.handshake::<_, Bytes>(stream).await?;
        let binder = Http2SessionBinder::bind(
            self.session_id.clone(),
            origin.clone(),
            ctx.client_h2_session.clone(),
            connection.ping_pong(),
        );
        socket.spawn_driver(Arc::clone(&binder).drive(connection, client.clone()));
        binder.on_remote_settings(client.current_max_send_streams(), client.current_max_recv_streams());

        let h2 = Http2Session {
            client,
            socket: Arc::clone(&socket),
            binder,
        };
        pool.register_http2_session(h2.clone());
        if let Some(address) = coalescing_key(&socket) {
            let mut sessions = self.http2_by_ip.entry(address).or_default();
            sessions.retain(|session| !session.is_closed());
            sessions.push(h2.clone());
        }
        tracing::debug!(
            session_id = %self.session_id,
            origin = %origin,
            socket_id = %socket.id(),
            "HTTP/2 server session created"
        );
        ctx.server_h2_session = Some(h2.clone());
        Ok(h2)
    }

    fn coalescable_session(&self, socket: &MitmSocket, host: &str) -> Option<Http2Session> {
        let address = coalescing_key(socket)?;
        let sessions = self.http2_by_ip.get(&address)?;
        sessions
            .iter()
            .find(|session| {
                !session.is_closed() && tls::certificate_valid_for(session.socket.server_certificates(), host)
            })
            .cloned()
    }

    fn use_http2_session(&self, ctx: &mut RequestContext, h2: &Http2Session) {
        ctx.assign_socket(Arc::clone(&h2.socket));
        ctx.server_h2_session = Some(h2.clone());
    }
}

/// Address HTTP/2 sessions are shared on. Only known when DNS was resolved locally.
fn coalescing_key(socket: &MitmSocket) -> Option<SocketAddr> {
    let ip = socket.dns_resolved_ip()?;
    let port = socket
        .info()
        .origin
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())?;
    Some(SocketAddr::new(ip, port))
}

fn build_http1_request(ctx: &RequestContext) -> Result<(Request<body::ProxyBody>, Option<FrameSender>)> {
    let (sender, request_body) = if ctx.has_request_body {
        let (tx, rx) = body::channel();
        (Some(tx), rx)
    } else {
        (None, body::empty())
    };
    let mut request = Request::builder()
        .method(ctx.method.clone())
        .uri(headers::path_and_query(&ctx.url))
        .version(Version::HTTP_11)
        .body(request_body)?;
    *request.headers_mut() = ctx.request_headers.clone();
    *request.extensions_mut() = ctx.request_extensions.clone();
    Ok((request, sender))
}

/// Watches a request sent on a reused socket for `window`.
///
/// A response inside the window is kept. A socket that closes first, or hands the
/// request back unsent, asks for a retry.
async fn probe_reused_socket(
    socket: &MitmSocket,
    mut response: Http1ResponseFuture,
    window: Duration,
) -> std::result::Result<Http1ResponseFuture, RetryReason> {
    tokio::select! {
        biased;
        result = &mut response => match result {
            Ok(response) => Ok(ready_response(response)),
            Err(mut error) => {
                if error.take_message().is_some() {
                    Err(RetryReason::ClosedBeforeWrite)
                } else {
                    Err(RetryReason::FlushError)
                }
            }
        },
        _ = socket.closed() => Err(RetryReason::ReceivedEof),
        _ = tokio::time::sleep(window) => Ok(response),
    }
}

fn ready_response(response: http::Response<Incoming>) -> Http1ResponseFuture {
    Box::pin(std::future::ready(Ok(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::tests::test_info;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn get(path: &str) -> Request<body::ProxyBody> {
        Request::builder()
            .uri(path)
            .header("host", "a.com")
            .body(body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn probe_keeps_live_sockets() {
        let (stream, mut peer) = tokio::io::duplex(4096);
        let socket = MitmSocket::new(test_info("a.com:80", None, false), Vec::new(), Box::new(stream));
        socket.ensure_http1().await.unwrap();
        let response = socket.send_http1(get("/")).await.unwrap();

        let probed = probe_reused_socket(&socket, response, Duration::from_millis(30));
        let server = async {
            let mut buf = [0u8; 1024];
            let n = peer.read(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GET / HTTP/1.1"));
            tokio::time::sleep(Duration::from_millis(60)).await;
            peer.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
            peer
        };
        let (probed, _peer) = tokio::join!(probed, server);
        let response = probed.unwrap().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn probe_flags_sockets_closed_by_the_server() {
        let (stream, peer) = tokio::io::duplex(4096);
        let socket = MitmSocket::new(test_info("a.com:80", None, false), Vec::new(), Box::new(stream));
        socket.ensure_http1().await.unwrap();
        drop(peer);
        let sent = socket.send_http1(get("/")).await;
        match sent {
            Ok(response) => {
                let reason = probe_reused_socket(&socket, response, Duration::from_millis(500))
                    .await
                    .err()
                    .unwrap();
                assert!(matches!(
                    reason,
                    RetryReason::ReceivedEof | RetryReason::ClosedBeforeWrite | RetryReason::FlushError
                ));
            }
            Err(error) => assert!(matches!(error, ProxyError::SocketClosed(_))),
        }
    }

    #[test]
    fn coalescing_needs_a_locally_resolved_address() {
        let mut info = test_info("a.com:443", Some("h2"), false);
        let (stream, _) = tokio::io::duplex(16);
        let unresolved = MitmSocket::new(info.clone(), Vec::new(), Box::new(stream));
        assert!(coalescing_key(&unresolved).is_none());

        info.dns_resolved_ip = Some("10.0.0.1".parse().unwrap());
        let (stream, _) = tokio::io::duplex(16);
        let resolved = MitmSocket::new(info, Vec::new(), Box::new(stream));
        assert_eq!(coalescing_key(&resolved), Some("10.0.0.1:443".parse().unwrap()));
    }
}
