//! Per-origin socket pool.
//!
//! # Responsibilities
//! - Hand out sockets for one `host:port`, reusing free HTTP/1.1 sockets
//! - Cap pooled sockets at `max_connections`, queueing callers FIFO beyond it
//! - Remember the negotiated ALPN and the shared HTTP/2 session
//! - Cancel waiters and close every socket when the pool closes
//!
//! # Design Decisions
//! - A fair `tokio::sync::Mutex` is the work queue: one caller at a time runs
//!   the "check session, check capacity, create" sequence, in arrival order
//! - Counters and socket sets sit behind a std mutex that is never held across
//!   an await, so close watchers and `free_socket` don't need a turn

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::agent::binder::Http2SessionBinder;
use crate::error::{ProxyError, Result};
use crate::net::{MitmSocket, SocketId};
use crate::sync::lock;

/// A server-facing HTTP/2 session shared by every request to an origin.
#[derive(Clone)]
pub struct Http2Session {
    pub client: h2::client::SendRequest<Bytes>,
    pub socket: Arc<MitmSocket>,
    pub binder: Arc<Http2SessionBinder>,
}

impl Http2Session {
    pub fn is_closed(&self) -> bool {
        self.socket.is_closed() || self.binder.is_closed()
    }
}

impl std::fmt::Debug for Http2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Session")
            .field("socket", &self.socket.id())
            .field("origin", &self.socket.info().origin)
            .finish()
    }
}

/// What a parked caller is woken with.
enum WaiterSignal {
    /// A released socket, handed over directly.
    Socket(Arc<MitmSocket>),
    /// A pooled socket closed, so there is room to create one.
    Capacity,
}

#[derive(Default)]
struct PoolState {
    all: HashMap<SocketId, Arc<MitmSocket>>,
    free: VecDeque<Arc<MitmSocket>>,
    pooled: usize,
    alpn: Option<String>,
    http2_sessions: Vec<Http2Session>,
    waiters: VecDeque<oneshot::Sender<WaiterSignal>>,
}

pub struct SocketPool {
    origin: String,
    max_connections: usize,
    wait_timeout: Duration,
    queue: tokio::sync::Mutex<()>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SocketPool")
            .field("origin", &self.origin)
            .field("all", &state.all.len())
            .field("free", &state.free.len())
            .field("pooled", &state.pooled)
            .field("alpn", &state.alpn)
            .finish()
    }
}

impl SocketPool {
    pub fn new(origin: impl Into<String>, max_connections: usize, wait_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.into(),
            max_connections: max_connections.max(1),
            wait_timeout,
            queue: tokio::sync::Mutex::new(()),
            state: Mutex::new(PoolState::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sockets counted against `max_connections`.
    pub fn pooled(&self) -> usize {
        lock(&self.state).pooled
    }

    /// Every live socket, including HTTP/2 and WebSocket ones.
    pub fn socket_count(&self) -> usize {
        lock(&self.state).all.len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.state).free.len()
    }

    pub fn alpn(&self) -> Option<String> {
        lock(&self.state).alpn.clone()
    }

    /// The first live HTTP/2 session registered for this origin.
    pub fn http2_session(&self) -> Option<Http2Session> {
        let mut state = lock(&self.state);
        state.http2_sessions.retain(|session| !session.is_closed());
        state.http2_sessions.first().cloned()
    }

    /// Returns a socket for one request, waiting in line behind earlier callers.
    pub async fn get_socket<F, Fut>(self: &Arc<Self>, is_websocket: bool, create: F) -> Result<Arc<MitmSocket>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MitmSocket>>,
    {
        self.ensure_open()?;
        let _turn = self.queue.lock().await;
        self.acquire(is_websocket, true, create).await
    }

    /// Like `get_socket`, but skips free sockets so the caller gets a new connection.
    pub async fn get_fresh_socket<F, Fut>(self: &Arc<Self>, create: F) -> Result<Arc<MitmSocket>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MitmSocket>>,
    {
        self.ensure_open()?;
        let _turn = self.queue.lock().await;
        self.acquire(false, false, create).await
    }

    /// Whether the origin speaks HTTP/2, connecting once to find out if nobody has yet.
    ///
    /// Runs on the same queue as `get_socket`, so concurrent probes share one connection.
    pub async fn is_http2<F, Fut>(self: &Arc<Self>, is_websocket: bool, create: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MitmSocket>>,
    {
        self.ensure_open()?;
        let _turn = self.queue.lock().await;
        if let Some(alpn) = self.alpn() {
            return Ok(alpn == "h2");
        }
        let socket = self.acquire(is_websocket, true, create).await?;
        let is_http2 = socket.is_http2();
        self.park(socket);
        Ok(is_http2)
    }

    async fn acquire<F, Fut>(self: &Arc<Self>, is_websocket: bool, reuse_free: bool, create: F) -> Result<Arc<MitmSocket>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MitmSocket>>,
    {
        let mut retired: Option<Arc<MitmSocket>> = None;
        loop {
            let waiter = {
                let mut state = lock(&self.state);
                if self.is_closed() {
                    return Err(ProxyError::canceled("socket pool closed"));
                }
                if !is_websocket {
                    state.http2_sessions.retain(|session| !session.is_closed());
                    if let Some(session) = state.http2_sessions.first() {
                        return Ok(Arc::clone(&session.socket));
                    }
                    while reuse_free {
                        let Some(socket) = state.free.pop_front() else {
                            break;
                        };
                        if !socket.is_closed() {
                            return Ok(socket);
                        }
                    }
                }
                if is_websocket || state.pooled < self.max_connections {
                    None
                } else {
                    // a caller that needs a new connection retires an idle one to make room
                    if !reuse_free {
                        if let Some(idle) = state.free.pop_front() {
                            retired = Some(idle);
                        }
                    }
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            };
            if let Some(idle) = retired.take() {
                idle.close();
            }

            let Some(waiter) = waiter else {
                break;
            };
            tracing::trace!(origin = %self.origin, "Socket pool at capacity, waiting");
            match tokio::time::timeout(self.wait_timeout, waiter).await {
                Ok(Ok(WaiterSignal::Socket(socket))) if reuse_free => return Ok(socket),
                Ok(Ok(WaiterSignal::Socket(socket))) => {
                    socket.close();
                    continue;
                }
                Ok(Ok(WaiterSignal::Capacity)) => continue,
                Ok(Err(_)) => return Err(ProxyError::canceled("socket pool closed")),
                Err(_) => {
                    return Err(ProxyError::Timeout {
                        what: "socket pool wait",
                        after: self.wait_timeout,
                    })
                }
            }
        }

        let socket = Arc::new(create().await?);
        if self.is_closed() {
            socket.close();
            return Err(ProxyError::canceled("socket pool closed"));
        }
        let counted = !socket.is_http2() && !socket.is_websocket();
        {
            let mut state = lock(&self.state);
            state.all.insert(socket.id(), Arc::clone(&socket));
            if counted {
                state.pooled += 1;
            }
            if state.alpn.is_none() {
                state.alpn = socket.alpn().map(str::to_string);
            }
        }
        self.watch_close(&socket, counted);
        tracing::debug!(
            origin = %self.origin,
            socket_id = %socket.id(),
            alpn = socket.alpn().unwrap_or("none"),
            pooled = counted,
            "Pool created socket"
        );
        Ok(socket)
    }

    /// Returns a socket after a request finished with it.
    ///
    /// The longest waiting caller gets it directly; otherwise it goes on the free list.
    pub fn free_socket(&self, socket: Arc<MitmSocket>) {
        if !socket.is_reusable() {
            return;
        }
        self.park(socket);
    }

    fn park(&self, mut socket: Arc<MitmSocket>) {
        if socket.is_closed() {
            return;
        }
        let mut state = lock(&self.state);
        if self.is_closed() {
            drop(state);
            socket.close();
            return;
        }
        if socket.is_reusable() {
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.send(WaiterSignal::Socket(socket)) {
                    Ok(()) => return,
                    Err(WaiterSignal::Socket(returned)) => socket = returned,
                    Err(WaiterSignal::Capacity) => return,
                }
            }
        }
        if !state.free.iter().any(|free| free.id() == socket.id()) {
            state.free.push_back(socket);
        }
    }

    /// Shares an HTTP/2 session with every request to this origin.
    pub fn register_http2_session(&self, session: Http2Session) {
        let mut state = lock(&self.state);
        if state
            .http2_sessions
            .iter()
            .any(|existing| existing.socket.id() == session.socket.id())
        {
            return;
        }
        state.alpn = Some("h2".to_string());
        state.free.retain(|free| free.id() != session.socket.id());
        state.http2_sessions.push(session);
    }

    /// Cancels waiters and closes every socket and HTTP/2 session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (sockets, sessions, waiters) = {
            let mut state = lock(&self.state);
            state.free.clear();
            state.pooled = 0;
            (
                state.all.drain().map(|(_, socket)| socket).collect::<Vec<_>>(),
                std::mem::take(&mut state.http2_sessions),
                std::mem::take(&mut state.waiters),
            )
        };
        // Dropping the senders rejects every waiter.
        drop(waiters);
        for session in sessions {
            session.binder.close();
            session.socket.close();
        }
        for socket in sockets {
            socket.close();
        }
        tracing::debug!(origin = %self.origin, "Socket pool closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::canceled("socket pool closed"));
        }
        Ok(())
    }

    fn watch_close(self: &Arc<Self>, socket: &Arc<MitmSocket>, counted: bool) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let socket = Arc::clone(socket);
        tokio::spawn(async move {
            socket.closed().await;
            if let Some(pool) = pool.upgrade() {
                pool.on_socket_closed(socket.id(), counted);
            }
        });
    }

    fn on_socket_closed(&self, id: SocketId, counted: bool) {
        let mut state = lock(&self.state);
        if state.all.remove(&id).is_none() {
            return;
        }
        state.free.retain(|socket| socket.id() != id);
        state.http2_sessions.retain(|session| session.socket.id() != id);
        if counted {
            state.pooled = state.pooled.saturating_sub(1);
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.send(WaiterSignal::Capacity).is_ok() {
                    break;
                }
            }
        }
        tracing::trace!(origin = %self.origin, socket_id = %id, pooled = state.pooled, "Pooled socket closed");
    }
}
