//! Per-exchange state.
//!
//! # Data Flow
//! ```text
//! front door / push handler
//!     → request_context.rs (RequestContext: url, headers, socket, response)
//!     → state.rs (forward-only ResourceState, one event per change)
//!     → emitted.rs (serializable resource for request/response/http-error events)
//! ```
//!
//! # Design Decisions
//! - A context is owned by the one task driving its exchange; hooks borrow it mutably
//! - Browser confirmation arrives on a watch channel and is applied by the owner

pub mod emitted;
pub mod request_context;
pub mod state;

pub use emitted::EmittedResource;
pub use request_context::{ClientRequestInfo, PushParent, RequestContext};
pub use state::ResourceState;
