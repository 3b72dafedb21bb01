//! Browsing sessions.
//!
//! # Data Flow
//! ```text
//! proxy front door → session id → RequestSession
//!     ├─ hooks.rs                    policy callbacks (DNS/TCP/TLS tuning, block, rewrite)
//!     ├─ intercept.rs                rules that answer requests without the network
//!     ├─ redirects.rs                redirect chains for previous/first-redirecting urls
//!     ├─ websocket.rs                upgrade ↔ browser request id correlation
//!     ├─ browser_request_matcher.rs  proxied request ↔ browser load correlation
//!     └─ events.rs                   request/response/http-error/socket events
//! ```
//!
//! # Design Decisions
//! - One `RequestSession` per browsing session; it owns its dispatcher and resolver
//! - Events go out on a broadcast channel; slow subscribers lag, they never block requests

pub mod browser_request_matcher;
pub mod events;
pub mod hooks;
pub mod intercept;
pub mod redirects;
pub mod request_session;
pub mod websocket;

pub use browser_request_matcher::{BrowserRequestMatcher, BrowserResourceLoad};
pub use events::SessionEvent;
pub use hooks::{DnsSettings, Http2ConnectSettings, NetworkHooks, TcpSettings, TlsSettings};
pub use intercept::{InterceptHandler, InterceptRequest, InterceptRule, InterceptedResponse, UrlPattern};
pub use request_session::{RequestSession, SessionOptions, SessionState};
