//! A connected server-facing socket.
//!
//! # Responsibilities
//! - Carry connection metadata (origin, ALPN, resolved address, peer certificates)
//! - Drive the HTTP/1.1 client connection, or hand the raw stream to HTTP/2
//! - Publish the closed state so pools and probes can react to EOF
//!
//! # Data Flow
//! ```text
//! connect.rs → MitmSocket { stream }
//!     → HTTP/1.1: ensure_http1() → SendRequest + driver task
//!     → HTTP/2:   take_stream() → agent h2 handshake → spawn_driver()
//! driver task exits → closed = true → pool + session observe it
//! ```

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::{http1, TrySendError};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::connection::SocketId;
use crate::error::{ProxyError, Result};
use crate::http::ProxyBody;
use crate::sync::lock;

/// Byte stream a socket runs over: plain TCP, TLS, or either through an upstream proxy.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedIo = Box<dyn Io>;

/// Pending HTTP/1.1 response. An unsent request is handed back in the error.
pub type Http1ResponseFuture = Pin<
    Box<
        dyn Future<
                Output = std::result::Result<Response<Incoming>, TrySendError<Request<ProxyBody>>>,
            > + Send,
    >,
>;

/// What observers need to know about a socket. Emitted with socket events.
#[derive(Debug, Clone)]
pub struct SocketInfo {
    pub id: SocketId,
    pub session_id: String,
    /// `host:port` the socket was opened for.
    pub origin: String,
    pub alpn: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub dns_resolved_ip: Option<IpAddr>,
    pub is_ssl: bool,
    pub is_websocket: bool,
    pub tls_client_hello_id: Option<String>,
    pub created_at: SystemTime,
    pub connect_time: Duration,
}

pub struct MitmSocket {
    info: SocketInfo,
    server_certificates: Vec<CertificateDer<'static>>,
    stream: Mutex<Option<BoxedIo>>,
    http1: tokio::sync::Mutex<Option<http1::SendRequest<ProxyBody>>>,
    is_reused: AtomicBool,
    closed: Arc<watch::Sender<bool>>,
    driver: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for MitmSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmSocket")
            .field("id", &self.info.id)
            .field("origin", &self.info.origin)
            .field("alpn", &self.info.alpn)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MitmSocket {
    pub fn new(info: SocketInfo, server_certificates: Vec<CertificateDer<'static>>, stream: BoxedIo) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            info,
            server_certificates,
            stream: Mutex::new(Some(stream)),
            http1: tokio::sync::Mutex::new(None),
            is_reused: AtomicBool::new(false),
            closed: Arc::new(closed),
            driver: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SocketId {
        self.info.id
    }

    pub fn info(&self) -> &SocketInfo {
        &self.info
    }

    pub fn alpn(&self) -> Option<&str> {
        self.info.alpn.as_deref()
    }

    pub fn is_http2(&self) -> bool {
        self.alpn() == Some("h2")
    }

    pub fn is_websocket(&self) -> bool {
        self.info.is_websocket
    }

    pub fn dns_resolved_ip(&self) -> Option<IpAddr> {
        self.info.dns_resolved_ip
    }

    pub fn server_certificates(&self) -> &[CertificateDer<'static>] {
        &self.server_certificates
    }

    pub fn is_reused(&self) -> bool {
        self.is_reused.load(Ordering::SeqCst)
    }

    pub fn mark_reused(&self) {
        self.is_reused.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the socket is closed, locally or by the peer.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// A receiver that flips to `true` when the socket closes.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Only open HTTP/1.1 sockets go back into a pool.
    pub fn is_reusable(&self) -> bool {
        !self.is_closed() && !self.is_websocket() && !self.is_http2()
    }

    /// Takes the raw stream for a protocol handshake done elsewhere.
    pub fn take_stream(&self) -> Option<BoxedIo> {
        lock(&self.stream).take()
    }

    /// Runs the connection task for this socket. The socket is closed when it ends.
    pub fn spawn_driver<F>(&self, driver: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let closed = Arc::clone(&self.closed);
        let handle = tokio::spawn(async move {
            driver.await;
            closed.send_replace(true);
        });
        *lock(&self.driver) = Some(handle.abort_handle());
        if self.is_closed() {
            handle.abort();
        }
    }

    /// Starts the HTTP/1.1 client connection on first use. Later calls are no-ops.
    pub async fn ensure_http1(&self) -> Result<()> {
        let mut sender = self.http1.lock().await;
        if sender.is_some() {
            return Ok(());
        }
        let stream = self
            .take_stream()
            .ok_or(ProxyError::SocketClosed("before http1 handshake"))?;
        let (request_sender, connection) = http1::Builder::new()
            .preserve_header_case(true)
            .handshake::<_, ProxyBody>(TokioIo::new(stream))
            .await?;
        *sender = Some(request_sender);

        let id = self.id();
        self.spawn_driver(async move {
            if let Err(error) = connection.with_upgrades().await {
                tracing::debug!(socket_id = %id, %error, "HTTP/1 connection ended with error");
            }
        });
        Ok(())
    }

    /// Waits until the connection accepts a request, then dispatches it.
    pub async fn send_http1(&self, request: Request<ProxyBody>) -> Result<Http1ResponseFuture> {
        let mut guard = self.http1.lock().await;
        let sender = guard
            .as_mut()
            .ok_or(ProxyError::SocketClosed("before http1 request"))?;
        sender
            .ready()
            .await
            .map_err(|_| ProxyError::SocketClosed("before http1 request"))?;
        Ok(Box::pin(sender.try_send_request(request)))
    }

    /// Closes the socket. Idempotent.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        tracing::trace!(socket_id = %self.id(), origin = %self.info.origin, "Closing socket");
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        lock(&self.stream).take();
        if let Ok(mut http1) = self.http1.try_lock() {
            http1.take();
        }
    }
}

impl Drop for MitmSocket {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}
