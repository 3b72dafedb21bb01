//! The proxy front door.
//!
//! # Responsibilities
//! - Bind the plain HTTP listener and the loopback TLS and HTTP/2 listeners
//! - Attribute every request, upgrade and `CONNECT` to a session (`407` / `504` otherwise)
//! - Serve HTTP/1.1 through hyper and HTTP/2 through the h2 server directly
//! - Keep the session registry, and close everything on `close()`
//!
//! # Data Flow
//! ```text
//! browser ──► http listener (hyper http1 + upgrades)
//!               ├─ CONNECT ──► tunnel.rs ──► https listener (TLS, http/1.1)
//!               │                       └──► http2 listener (TLS, h2 | http/1.1)
//!               ├─ Upgrade ──► HttpUpgradeHandler
//!               └─ request ──► HttpRequestHandler ──► ClientResponse::http1
//! http2 listener, ALPN h2 ──► h2::server accept loop
//!               └─ stream  ──► HttpRequestHandler ──► ClientResponse::http2
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::auth::{self, SessionLookup, SessionRegistry};
use super::certs::{CertificateGenerator, CertificateStore};
use super::tunnel;
use crate::agent::{ClientHttp2Session, ClientSignal};
use crate::config::ListenerConfig;
use crate::context::{ClientRequestInfo, RequestContext};
use crate::error::{ProxyError, Result};
use crate::handlers::{ClientResponse, HttpRequestHandler, HttpUpgradeHandler};
use crate::http::body::{self, IncomingBody, ProxyBody};
use crate::http::headers;
use crate::lifecycle::Shutdown;
use crate::net::{tls, Listener, ListenerKind, TunnelTracker};
use crate::session::RequestSession;

/// Delay before a closed session's port mappings are dropped, so lingering
/// requests on its tunnels still resolve.
const SESSION_LINGER: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Where a connection came in.
#[derive(Debug, Clone, Copy)]
struct ConnectionInfo {
    remote_addr: SocketAddr,
    is_ssl: bool,
}

/// State shared by the accept loops, connections and tunnels.
pub(crate) struct ProxyShared {
    pub(crate) registry: SessionRegistry,
    pub(crate) certificates: Arc<CertificateStore>,
    pub(crate) tunnels: TunnelTracker,
    pub(crate) http_addr: SocketAddr,
    pub(crate) https_addr: SocketAddr,
    pub(crate) http2_addr: SocketAddr,
    shutdown: Shutdown,
}

/// A running MITM proxy.
#[derive(Clone)]
pub struct MitmProxy {
    shared: Arc<ProxyShared>,
}

impl std::fmt::Debug for MitmProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmProxy")
            .field("http", &self.shared.http_addr)
            .field("https", &self.shared.https_addr)
            .field("http2", &self.shared.http2_addr)
            .field("sessions", &self.shared.registry.len())
            .finish()
    }
}

impl MitmProxy {
    /// Binds the three listeners and starts accepting.
    pub async fn start(config: &ListenerConfig, generator: Arc<dyn CertificateGenerator>) -> Result<Self> {
        let http = Listener::bind(&config.bind_address, ListenerKind::Http, config.max_connections).await?;
        let https = Listener::bind(&config.loopback_address, ListenerKind::Https, config.max_connections).await?;
        let http2 = Listener::bind(&config.loopback_address, ListenerKind::Http2, config.max_connections).await?;

        let certificates = Arc::new(CertificateStore::new(generator));
        let shared = Arc::new(ProxyShared {
            registry: SessionRegistry::new(),
            certificates,
            tunnels: TunnelTracker::new(),
            http_addr: tunnel::loopback_target(http.local_addr()?),
            https_addr: tunnel::loopback_target(https.local_addr()?),
            http2_addr: tunnel::loopback_target(http2.local_addr()?),
            shutdown: Shutdown::new(),
        });

        for listener in [http, https, http2] {
            let shutdown = shared.shutdown.subscribe();
            tokio::spawn(Arc::clone(&shared).accept_loop(listener, shutdown));
        }

        tracing::info!(
            http = %shared.http_addr,
            https = %shared.https_addr,
            http2 = %shared.http2_addr,
            "MITM proxy listening"
        );
        Ok(Self { shared })
    }

    /// Port of the plain HTTP listener browsers are pointed at.
    pub fn port(&self) -> u16 {
        self.shared.http_addr.port()
    }

    pub fn https_port(&self) -> u16 {
        self.shared.https_addr.port()
    }

    pub fn http2_port(&self) -> u16 {
        self.shared.http2_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.http_addr
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        &self.shared.certificates
    }

    pub fn active_tunnels(&self) -> usize {
        self.shared.tunnels.active_count()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<RequestSession>> {
        self.shared.registry.get(session_id)
    }

    /// Makes a session reachable through this proxy.
    ///
    /// A default session owns every connection regardless of credentials, and
    /// closing it closes the proxy. Other sessions are forgotten shortly after
    /// they close.
    pub fn register_session(&self, session: Arc<RequestSession>, is_default: bool) {
        self.shared.registry.register(Arc::clone(&session), is_default);
        tracing::debug!(session_id = %session.id(), is_default, "Session registered");

        let shared: Weak<ProxyShared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            session.closed().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if is_default {
                shared.close().await;
            } else {
                tokio::time::sleep(SESSION_LINGER).await;
                shared.registry.remove(session.id());
            }
        });
    }

    pub fn remove_session_tracking(&self, session_id: &str) {
        self.shared.registry.remove(session_id);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }

    /// Closes every session and tunnel and stops the listeners. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

impl ProxyShared {
    pub(crate) fn is_closing(&self) -> bool {
        self.shutdown.is_triggered()
    }

    async fn close(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        let sessions = self.registry.sessions();
        futures_util::future::join_all(sessions.iter().map(|session| session.close())).await;
        let tunnels = self.tunnels.close_all();
        tracing::info!(sessions = sessions.len(), tunnels, "MITM proxy closed");
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener, mut shutdown: broadcast::Receiver<()>) {
        let kind = listener.kind();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr, permit)) => {
                        let shared = Arc::clone(&self);
                        tokio::spawn(async move {
                            shared.serve_connection(stream, remote_addr, kind).await;
                            drop(permit);
                        });
                    }
                    Err(error) => {
                        if self.is_closing() {
                            tracing::debug!(listener = kind.as_str(), %error, "Listener error while closing");
                        } else {
                            tracing::error!(listener = kind.as_str(), %error, "Listener error");
                        }
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        tracing::debug!(listener = kind.as_str(), "Listener stopped");
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr, kind: ListenerKind) {
        let _ = stream.set_nodelay(true);
        let alpn: &[&[u8]] = match kind {
            ListenerKind::Http => {
                let info = ConnectionInfo { remote_addr, is_ssl: false };
                return self.serve_http1(stream, info).await;
            }
            ListenerKind::Https => &[tls::ALPN_HTTP1],
            ListenerKind::Http2 => &[tls::ALPN_H2, tls::ALPN_HTTP1],
        };

        // The tunnel records its host after connecting, so look it up at handshake time.
        let port = remote_addr.port();
        let handshake = self
            .certificates
            .accept(stream, || self.registry.tunnel_host(port), alpn);
        let stream = match handshake.await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!(remote_addr = %remote_addr, %error, "Client TLS handshake failed");
                return;
            }
        };
        let is_h2 = stream.get_ref().1.alpn_protocol() == Some(tls::ALPN_H2);
        if is_h2 {
            self.serve_http2(stream, remote_addr).await;
        } else {
            let info = ConnectionInfo { remote_addr, is_ssl: true };
            self.serve_http1(stream, info).await;
        }
    }

    // ---- HTTP/1.1 ----

    async fn serve_http1<IO>(self: Arc<Self>, io: IO, info: ConnectionInfo)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::clone(&self);
        let service = service_fn(move |request| Arc::clone(&shared).on_http1_request(request, info));
        if let Err(error) = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            tracing::debug!(remote_addr = %info.remote_addr, %error, "Client connection ended with error");
        }
    }

    async fn on_http1_request(
        self: Arc<Self>,
        mut request: Request<Incoming>,
        info: ConnectionInfo,
    ) -> Result<Response<ProxyBody>> {
        let session = match self.registry.lookup(request.headers(), info.remote_addr.port()) {
            SessionLookup::Found(session) => session,
            SessionLookup::Unauthenticated => return Ok(auth::proxy_auth_required()),
            SessionLookup::NotRegistered(session_id) => {
                tracing::warn!(
                    session_id = %session_id,
                    is_ssl = info.is_ssl,
                    method = %request.method(),
                    url = %request.uri(),
                    "MitmProxy.RequestWithoutSession"
                );
                return Ok(auth::proxy_error());
            }
        };
        // Dropping the connection is the answer for a session on its way out.
        if session.is_closing() {
            return Err(ProxyError::canceled("session closing"));
        }

        if request.method() == Method::CONNECT {
            return Ok(self.on_connect(session, &mut request));
        }

        let is_upgrade =
            headers::is_upgrade_request(request.headers()) && !session.bypass_all_with_empty_response();
        let client_upgrade = is_upgrade.then(|| hyper::upgrade::on(&mut request));
        let (mut parts, client_body) = request.into_parts();
        let client = ClientRequestInfo {
            is_ssl: info.is_ssl,
            is_http2: false,
            is_upgrade,
            remote_addr: Some(info.remote_addr),
        };
        let ctx = match RequestContext::from_client_request(session, &mut parts, client) {
            Ok(ctx) => ctx,
            Err(error) => {
                tracing::debug!(url = %parts.uri, %error, "Unparseable client request");
                return Ok(status_response(StatusCode::BAD_REQUEST));
            }
        };

        let (client, response) = ClientResponse::http1();
        match client_upgrade {
            Some(upgrade) => tokio::spawn(HttpUpgradeHandler::new(ctx, upgrade, client).run()),
            None => tokio::spawn(HttpRequestHandler::new(ctx, IncomingBody::Http1(client_body), client).run()),
        };
        response
            .await
            .map_err(|_| ProxyError::SocketClosed("before a response was written"))
    }

    fn on_connect(self: &Arc<Self>, session: Arc<RequestSession>, request: &mut Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = request.uri().authority().cloned() else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let upgrade = hyper::upgrade::on(request);
        tokio::spawn(tunnel::run(Arc::clone(self), session, authority, upgrade));
        Response::new(body::empty())
    }

    // ---- HTTP/2 ----

    async fn serve_http2<IO>(self: Arc<Self>, io: IO, remote_addr: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut connection = match h2::server::handshake(io).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!(remote_addr = %remote_addr, %error, "Client HTTP/2 handshake failed");
                return;
            }
        };
        let client_session = ClientHttp2Session::new();
        let mut signals = client_session.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let mut shutting_down = false;

        loop {
            tokio::select! {
                accepted = connection.accept() => match accepted {
                    Some(Ok((request, respond))) => {
                        let shared = Arc::clone(&self);
                        let client_session = Arc::clone(&client_session);
                        tokio::spawn(shared.on_http2_stream(request, respond, remote_addr, client_session));
                    }
                    Some(Err(error)) => {
                        tracing::debug!(remote_addr = %remote_addr, %error, "Client HTTP/2 session error");
                        break;
                    }
                    None => break,
                },
                changed = signals.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let signal = signals.borrow_and_update().clone();
                    match signal {
                        Some(ClientSignal::GoAway) | Some(ClientSignal::Close) => connection.graceful_shutdown(),
                        Some(ClientSignal::Destroy(reason)) => {
                            tracing::debug!(remote_addr = %remote_addr, reason = %reason, "Destroying client HTTP/2 session");
                            connection.abrupt_shutdown(h2::Reason::INTERNAL_ERROR);
                        }
                        None => {}
                    }
                }
                _ = shutdown.recv(), if !shutting_down => {
                    shutting_down = true;
                    connection.graceful_shutdown();
                }
            }
        }
        client_session.mark_closed();
    }

    async fn on_http2_stream(
        self: Arc<Self>,
        request: Request<h2::RecvStream>,
        respond: h2::server::SendResponse<Bytes>,
        remote_addr: SocketAddr,
        client_session: Arc<ClientHttp2Session>,
    ) {
        let mut client = ClientResponse::http2(respond);
        let session = match self.registry.lookup(request.headers(), remote_addr.port()) {
            SessionLookup::Found(session) => session,
            SessionLookup::Unauthenticated => {
                let response = auth::proxy_auth_required();
                let _ = client.write_head(response.status(), response.headers().clone(), true).await;
                return;
            }
            SessionLookup::NotRegistered(session_id) => {
                tracing::warn!(
                    session_id = %session_id,
                    is_ssl = true,
                    url = %request.uri(),
                    "MitmProxy.RequestWithoutSession"
                );
                let _ = client.write_head(StatusCode::GATEWAY_TIMEOUT, http::HeaderMap::new(), true).await;
                return;
            }
        };
        if session.is_closing() {
            client.abort().await;
            return;
        }

        let (mut parts, client_body) = request.into_parts();
        let info = ClientRequestInfo {
            is_ssl: true,
            is_http2: true,
            is_upgrade: false,
            remote_addr: Some(remote_addr),
        };
        match RequestContext::from_client_request(session, &mut parts, info) {
            Ok(mut ctx) => {
                ctx.client_h2_session = Some(client_session);
                HttpRequestHandler::new(ctx, IncomingBody::http2(client_body), client)
                    .run()
                    .await;
            }
            Err(error) => {
                tracing::debug!(url = %parts.uri, %error, "Unparseable client HTTP/2 request");
                client.send_error(StatusCode::BAD_REQUEST, None).await;
            }
        }
    }
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = status;
    response
}
