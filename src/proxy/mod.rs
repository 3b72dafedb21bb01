//! Proxy front door.
//!
//! # Data Flow
//! ```text
//! browser ──► server.rs (listeners, HTTP/1.1 + HTTP/2 serving)
//!               ├─ auth.rs    session id from Proxy-Authorization or tunnel port
//!               ├─ tunnel.rs  CONNECT → loopback TLS / HTTP/2 / plain listener
//!               └─ certs.rs   per-hostname leaf certificates, minted before each handshake
//!            ──► handlers (one task per exchange)
//! ```
//!
//! # Design Decisions
//! - CONNECT tunnels loop back into the proxy's own listeners, so TLS traffic
//!   goes through the same hyper / h2 serving code as plain requests
//! - Requests without a session never reach a handler

pub mod auth;
pub mod certs;
pub mod server;
mod tunnel;

pub use auth::{read_session_id, SessionLookup, SessionRegistry};
pub use certs::{CertificateAuthority, CertificateGenerator, CertificateStore, GeneratedCertificate};
pub use server::MitmProxy;
