//! Socket identifiers and tunnel lifetime tracking.
//!
//! # Responsibilities
//! - Hand out server-facing socket ids, one sequence per socket session
//! - Track CONNECT tunnels so proxy shutdown can force-close them

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::observability::metrics;
use crate::sync::lock;

/// Unique identifier for a server-facing socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

/// Monotonic source of socket ids, starting at 1.
#[derive(Debug)]
pub struct SocketIdSequence(AtomicU64);

impl SocketIdSequence {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next_id(&self) -> SocketId {
        SocketId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SocketIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks live CONNECT tunnels.
///
/// Each tunnel registers a kill switch; `close_all` fires every switch.
#[derive(Debug, Clone, Default)]
pub struct TunnelTracker {
    tunnels: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl TunnelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tunnel. The guard unregisters it on drop; the receiver fires on `close_all`.
    pub fn track(&self) -> (TunnelGuard, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let count = {
            let mut tunnels = lock(&self.tunnels);
            tunnels.insert(id, tx);
            tunnels.len()
        };
        metrics::record_active_tunnels(count as u64);
        (
            TunnelGuard {
                id,
                tunnels: Arc::clone(&self.tunnels),
            },
            rx,
        )
    }

    pub fn active_count(&self) -> usize {
        lock(&self.tunnels).len()
    }

    /// Signals every tracked tunnel to shut down.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.tunnels).drain().collect();
        let count = drained.len();
        for (_, kill) in drained {
            let _ = kill.send(());
        }
        metrics::record_active_tunnels(0);
        count
    }
}

/// Guard that tracks a tunnel's lifetime.
#[derive(Debug)]
pub struct TunnelGuard {
    id: u64,
    tunnels: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        let count = {
            let mut tunnels = lock(&self.tunnels);
            tunnels.remove(&self.id);
            tunnels.len()
        };
        metrics::record_active_tunnels(count as u64);
        tracing::trace!(tunnel_id = self.id, "Tunnel closed");
    }
}
