//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher.request(ctx)
//!     → SocketPool for ctx's origin (host:port)
//!         → live HTTP/2 session? share its socket
//!         → free socket? reuse it
//!         → under max_connections? create one
//!         → otherwise queue until a socket is freed or closes
//! ```
//!
//! # Design Decisions
//! - HTTP/2 and WebSocket sockets never count toward the per-origin limit
//! - A socket's close is observed by a watcher task, which decrements the count
//!   and wakes the next waiter

pub mod socket_pool;

pub use socket_pool::{Http2Session, SocketPool};
