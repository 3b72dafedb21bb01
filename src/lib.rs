//! Session-aware man-in-the-middle proxy for a controlled browser.
//!
//! A browser is pointed at the proxy with `Proxy-Authorization: Basic user:sessionId`.
//! Every exchange is attributed to a `RequestSession`, correlated with what the
//! browser reports, optionally intercepted or served from an ETag cache, and
//! replayed to the origin over pooled HTTP/1.1 sockets or shared HTTP/2 sessions.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod proxy;

// Request engine
pub mod agent;
pub mod cache;
pub mod context;
pub mod dns;
pub mod handlers;
pub mod pool;
pub mod session;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
mod sync;

pub use config::schema::ProxyConfig;
pub use error::{ProxyError, Result};
pub use lifecycle::Shutdown;
pub use proxy::{CertificateAuthority, CertificateGenerator, MitmProxy};
pub use session::{RequestSession, SessionEvent, SessionOptions};
