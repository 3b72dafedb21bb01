//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client side
//!     listener.rs (accept loop, connection limits)
//!     → tls.rs (server config, SNI certificate resolver)
//!     → connection.rs (CONNECT tunnel tracking for shutdown)
//!
//! Server side
//!     connect.rs (TCP tuning, upstream proxy CONNECT, TLS + ALPN)
//!     → socket.rs (MitmSocket: HTTP/1.1 driver or raw stream for HTTP/2)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - A socket's closed state is a watch channel so pools, probes and sessions
//!   all observe EOF without polling

pub mod connect;
pub mod connection;
pub mod listener;
pub mod socket;
pub mod tls;

pub use connect::{ConnectOptions, SocketSession, SocketSettings, UpstreamProxy};
pub use connection::{SocketId, SocketIdSequence, TunnelTracker};
pub use listener::{Listener, ListenerKind};
pub use socket::{MitmSocket, SocketInfo};
