//! Network hooks a session's policy layer can register.
//!
//! Every method has a no-op default. The session calls hooks in registration
//! order and awaits each one before moving on.

use async_trait::async_trait;
use url::Url;

use crate::config::DnsOverTlsConfig;
use crate::context::RequestContext;
use crate::http::ResourceType;

/// Resolver choice for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsSettings {
    pub dns_over_tls: Option<DnsOverTlsConfig>,
    /// Let the upstream proxy resolve names instead of resolving locally.
    pub use_upstream_proxy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpSettings {
    pub ttl: Option<u32>,
    pub window_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub tls_client_hello_id: Option<String>,
    pub sockets_per_origin: usize,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            tls_client_hello_id: None,
            sockets_per_origin: 6,
        }
    }
}

/// Settings applied to a new server-facing HTTP/2 session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2ConnectSettings {
    pub initial_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub header_table_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_push: bool,
}

#[async_trait]
pub trait NetworkHooks: Send + Sync {
    async fn on_dns_configuration(&self, _settings: &mut DnsSettings) {}

    async fn on_tcp_configuration(&self, _settings: &mut TcpSettings) {}

    async fn on_tls_configuration(&self, _settings: &mut TlsSettings) {}

    /// Called once per request after its headers are prepared, before they are sent.
    async fn before_http_request(&self, _ctx: &mut RequestContext) {}

    /// Called before the response head goes to the client. May rewrite headers.
    async fn before_http_response(&self, _ctx: &mut RequestContext) {}

    async fn should_block_request(&self, _url: &Url, _resource_type: Option<ResourceType>) -> bool {
        false
    }

    async fn on_http2_session_connect(&self, _ctx: &RequestContext, _settings: &mut Http2ConnectSettings) {}

    async fn website_has_first_party_interaction(&self, _url: &Url) {}
}
