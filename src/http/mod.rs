//! HTTP message helpers shared by the front door, dispatcher and handlers.
//!
//! # Data Flow
//! ```text
//! client request headers
//!     → resource.rs (Fetch metadata → resource type, origin type)
//!     → headers.rs (strip proxy-*, HTTP/1.1 ↔ HTTP/2 translation)
//!     → server request
//!
//! server response headers
//!     → headers.rs (sanitize, redirect detection)
//!     → client response
//!
//! bodies in both directions
//!     → body.rs (IncomingBody reader, channel-backed ProxyBody writer)
//! ```
//!
//! # Design Decisions
//! - Stateless free functions over `http::HeaderMap`
//! - Pseudo headers are derived from the request uri by h2, never stored as headers

pub mod body;
pub mod headers;
pub mod resource;

pub use body::{IncomingBody, ProxyBody};
pub use resource::{OriginType, ResourceType};
