//! Session-scoped request dispatch.
//!
//! # Data Flow
//! ```text
//! orchestrator → RequestAgent::request(ctx)
//!     → pool (per origin) → MitmSocket (HTTP/1.1) | Http2Session (shared)
//!     → ServerRequest (response future + body sink)
//! server HTTP/2 session ⇄ Http2SessionBinder ⇄ ClientHttp2Session (browser side)
//! ```

pub mod binder;
pub mod request_agent;

pub use binder::{ClientHttp2Session, ClientSignal, Http2SessionBinder};
pub use request_agent::{RequestAgent, RetryReason, ServerRequest};
