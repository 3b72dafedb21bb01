//! DNS resolution subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher.lookup_dns(host)
//!     → resolver.rs (IP literal? cached entry? → round-robin address)
//!     → tls_socket.rs (miss: DNS-over-TLS query, one reconnect on EOF)
//!     → message.rs (wire encode/decode)
//!     → system resolver on any DNS-over-TLS failure
//! ```
//!
//! # Design Decisions
//! - One resolver per dispatcher, so DNS-over-TLS settings can differ per session
//! - Closing the resolver cancels in-flight queries with a cancellation error

pub mod message;
pub mod resolver;
pub mod tls_socket;

pub use message::DnsError;
pub use resolver::DnsResolver;
pub use tls_socket::DnsOverTlsSocket;
