//! Error taxonomy for the proxy engine.
//!
//! # Design Decisions
//! - One crate-wide `ProxyError`; subsystems with their own wire formats
//!   (DNS, config) keep narrow error types and convert into it
//! - Cancellation is its own variant so teardown noise can be filtered
//!   from logs and mapped to status `444`

use std::time::Duration;

/// Boxed error used for streaming bodies handed to hyper.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while proxying a request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid http message: {0}")]
    HttpMessage(#[from] http::Error),

    #[error("http2 error: {0}")]
    H2(#[from] h2::Error),

    /// The owning session, pool or DNS socket is shutting down.
    #[error("canceled: {reason}")]
    Canceled { reason: String },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("dns lookup failed: {0}")]
    Dns(String),

    #[error("upstream proxy error: {0}")]
    UpstreamProxy(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("socket closed {0}")]
    SocketClosed(&'static str),
}

impl ProxyError {
    pub fn canceled(reason: impl Into<String>) -> Self {
        ProxyError::Canceled { reason: reason.into() }
    }

    /// True for errors caused by a session or pool shutting down.
    pub fn is_canceled(&self) -> bool {
        match self {
            ProxyError::Canceled { .. } => true,
            ProxyError::H2(e) => e.reason() == Some(h2::Reason::CANCEL) && !e.is_remote(),
            _ => false,
        }
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(e: url::ParseError) -> Self {
        ProxyError::InvalidUrl(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout {
            what: "operation",
            after: Duration::ZERO,
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
