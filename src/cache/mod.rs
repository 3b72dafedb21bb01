//! ETag response cache.
//!
//! # Data Flow
//! ```text
//! Orchestrator / push handler
//!     → handler.rs (one CacheHandler per exchange)
//!     → store.rs (shared ResponseCache, owned by the proxy)
//! ```
//!
//! # Design Decisions
//! - Disabled unless `cache.enabled`; handlers then hold no store and are inert
//! - GET only, keyed by absolute url, last write wins
//! - Only responses that carry an ETag are stored, since nothing else can be revalidated

pub mod handler;
pub mod store;

pub use handler::CacheHandler;
pub use store::{CachedResponse, ResponseCache};
