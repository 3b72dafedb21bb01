//! Keeps a browser-facing HTTP/2 connection in step with the server-facing session.
//!
//! # Responsibilities
//! - Keep the server session alive with pings while the browser connection is open
//! - Turn a server GOAWAY, close or error into the matching signal on the browser side
//! - Log the server session's stream limits once it is up
//!
//! # Data Flow
//! ```text
//! server h2 Connection (driver task) ends
//!     → Ok: the send handle's error tells a peer GOAWAY from a bare close
//!     → Http2SessionBinder::on_server_closed(error)
//!     → ClientHttp2Session::signal(GoAway | Close | Destroy)
//!     → proxy h2 server loop: graceful_shutdown() / abrupt_shutdown()
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::sync::lock;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// What the browser-facing connection should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    /// The server sent GOAWAY: stop taking new streams, finish open ones.
    GoAway,
    /// The server session ended cleanly.
    Close,
    /// The server session failed.
    Destroy(String),
}

/// Handle on one browser-facing HTTP/2 connection.
#[derive(Debug)]
pub struct ClientHttp2Session {
    signal: watch::Sender<Option<ClientSignal>>,
    closed: AtomicBool,
}

impl ClientHttp2Session {
    pub fn new() -> Arc<Self> {
        let (signal, _) = watch::channel(None);
        Arc::new(Self {
            signal,
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ClientSignal>> {
        self.signal.subscribe()
    }

    /// Records a signal. A stronger signal replaces a weaker one, never the reverse.
    pub fn signal(&self, signal: ClientSignal) {
        self.signal.send_if_modified(|current| {
            let replace = match (&*current, &signal) {
                (None, _) => true,
                (Some(ClientSignal::GoAway), ClientSignal::Close | ClientSignal::Destroy(_)) => true,
                (Some(ClientSignal::Close), ClientSignal::Destroy(_)) => true,
                _ => false,
            };
            if replace {
                *current = Some(signal.clone());
            }
            replace
        });
    }

    pub fn current_signal(&self) -> Option<ClientSignal> {
        self.signal.borrow().clone()
    }

    /// Marks the browser connection as gone.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Glue between one server-facing HTTP/2 session and the browser connection that opened it.
#[derive(Debug)]
pub struct Http2SessionBinder {
    session_id: String,
    origin: String,
    client: Option<Arc<ClientHttp2Session>>,
    closed: AtomicBool,
    pinger: Mutex<Option<AbortHandle>>,
}

impl Http2SessionBinder {
    pub fn bind(
        session_id: impl Into<String>,
        origin: impl Into<String>,
        client: Option<Arc<ClientHttp2Session>>,
        ping_pong: Option<h2::PingPong>,
    ) -> Arc<Self> {
        let binder = Arc::new(Self {
            session_id: session_id.into(),
            origin: origin.into(),
            client,
            closed: AtomicBool::new(false),
            pinger: Mutex::new(None),
        });
        if let (Some(ping_pong), Some(client)) = (ping_pong, binder.client.clone()) {
            let handle = tokio::spawn(keep_alive(
                Arc::downgrade(&binder),
                client,
                ping_pong,
            ));
            *lock(&binder.pinger) = Some(handle.abort_handle());
        }
        binder
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Logs the limits the server advertised.
    pub fn on_remote_settings(&self, max_send_streams: usize, max_recv_streams: usize) {
        tracing::debug!(
            session_id = %self.session_id,
            origin = %self.origin,
            max_send_streams,
            max_recv_streams,
            "HTTP/2 server session settings"
        );
    }

    /// Drives the server connection until it ends, then reports how.
    pub async fn drive<T, B>(
        self: Arc<Self>,
        connection: h2::client::Connection<T, B>,
        handle: h2::client::SendRequest<B>,
    ) where
        T: AsyncRead + AsyncWrite + Unpin,
        B: Buf,
    {
        let error = match connection.await {
            Err(error) => Some(error),
            // a graceful GOAWAY ends the connection cleanly but stays on the handle
            Ok(()) => handle.ready().await.err().filter(h2::Error::is_go_away),
        };
        self.on_server_closed(error);
    }

    /// Called when the server connection task ends.
    pub fn on_server_closed(&self, error: Option<h2::Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_pinging();
        let signal = match &error {
            Some(error) if error.is_go_away() => {
                tracing::debug!(session_id = %self.session_id, origin = %self.origin, %error, "HTTP/2 server sent GOAWAY");
                ClientSignal::GoAway
            }
            Some(error) if error.is_io() => {
                tracing::debug!(session_id = %self.session_id, origin = %self.origin, %error, "HTTP/2 server connection lost");
                ClientSignal::Destroy(error.to_string())
            }
            Some(error) => {
                tracing::warn!(session_id = %self.session_id, origin = %self.origin, %error, "HTTP/2 server session error");
                ClientSignal::Destroy(error.to_string())
            }
            None => {
                tracing::debug!(session_id = %self.session_id, origin = %self.origin, "HTTP/2 server session closed");
                ClientSignal::Close
            }
        };
        if let Some(client) = &self.client {
            if !client.is_closed() {
                client.signal(signal);
            }
        }
    }

    /// Stops watching the server session. The browser connection is left alone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_pinging();
    }

    fn stop_pinging(&self) {
        if let Some(handle) = lock(&self.pinger).take() {
            handle.abort();
        }
    }
}

impl Drop for Http2SessionBinder {
    fn drop(&mut self) {
        self.stop_pinging();
    }
}

async fn keep_alive(
    binder: std::sync::Weak<Http2SessionBinder>,
    client: Arc<ClientHttp2Session>,
    mut ping_pong: h2::PingPong,
) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if client.is_closed() {
            return;
        }
        let Some(origin) = binder.upgrade().map(|b| b.origin.clone()) else {
            return;
        };
        let started = tokio::time::Instant::now();
        match ping_pong.ping(h2::Ping::opaque()).await {
            Ok(_) => {
                tracing::trace!(%origin, rtt_ms = started.elapsed().as_millis() as u64, "HTTP/2 server ping");
            }
            Err(error) => {
                tracing::debug!(%origin, %error, "HTTP/2 server ping failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stronger_signals_win() {
        let client = ClientHttp2Session::new();
        client.signal(ClientSignal::GoAway);
        client.signal(ClientSignal::Destroy("reset".into()));
        client.signal(ClientSignal::Close);
        assert_eq!(client.current_signal(), Some(ClientSignal::Destroy("reset".into())));
    }

    #[tokio::test]
    async fn server_close_reaches_the_client_once() {
        let client = ClientHttp2Session::new();
        let mut rx = client.subscribe();
        let binder = Http2SessionBinder::bind("s1", "a.com:443", Some(Arc::clone(&client)), None);
        binder.on_server_closed(None);
        binder.on_server_closed(Some(h2::Error::from(h2::Reason::INTERNAL_ERROR)));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(ClientSignal::Close));
        assert!(binder.is_closed());
    }

    #[tokio::test]
    async fn graceful_server_goaway_reaches_the_client_as_goaway() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut connection = h2::server::handshake(server_io).await.unwrap();
            connection.graceful_shutdown();
            while connection.accept().await.is_some() {}
            // keep the transport open so the client sees the GOAWAY, not EOF
            std::future::pending::<()>().await;
        });
        let (handle, connection) = h2::client::handshake(client_io).await.unwrap();

        let client = ClientHttp2Session::new();
        let binder = Http2SessionBinder::bind("s1", "a.com:443", Some(Arc::clone(&client)), None);
        tokio::time::timeout(Duration::from_secs(5), Arc::clone(&binder).drive(connection, handle))
            .await
            .unwrap();
        assert!(binder.is_closed());
        assert_eq!(client.current_signal(), Some(ClientSignal::GoAway));
    }

    #[tokio::test]
    async fn closed_clients_are_not_signalled() {
        let client = ClientHttp2Session::new();
        client.mark_closed();
        let binder = Http2SessionBinder::bind("s1", "a.com:443", Some(Arc::clone(&client)), None);
        binder.on_server_closed(None);
        assert_eq!(client.current_signal(), None);
    }
}
