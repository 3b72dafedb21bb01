//! Per-exchange handlers.
//!
//! # Data Flow
//! ```text
//! proxy front door (h1 service / h2 accept loop)
//!     → RequestContext + ClientResponse
//!     ├─ http_request.rs   ordinary requests (the orchestrator)
//!     ├─ upgrade.rs        Upgrade requests, spliced after 101
//!     └─ push_promise.rs   server pushes on HTTP/2 exchanges
//! client_response.rs writes the answer back over HTTP/1.1 or HTTP/2
//! ```
//!
//! # Design Decisions
//! - Each exchange runs on its own task and owns its context
//! - Handlers never return errors; failures become statuses and `http-error` events

pub mod client_response;
pub mod http_request;
pub mod push_promise;
pub mod upgrade;

pub use client_response::{ClientResponse, SharedSendResponse};
pub use http_request::{HttpRequestHandler, EMPTY_HTML};
pub use upgrade::HttpUpgradeHandler;
