//! Everything known about one request/response exchange.
//!
//! # Responsibilities
//! - Build the absolute target url from a client request
//! - Hold request and response metadata as the exchange progresses
//! - Enforce forward-only state transitions and report each one
//! - Produce the resource description emitted with session events
//!
//! # Data Flow
//! ```text
//! client request parts → RequestContext::from_client_request
//!     → orchestrator mutates it through the states
//!     → to_emitted_resource() → session events
//! h2 push on a parent exchange → RequestContext::from_http2_push
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Uri};
use url::Url;

use super::emitted::{EmittedRequest, EmittedResource, EmittedResponse};
use super::state::ResourceState;
use crate::agent::binder::ClientHttp2Session;
use crate::cache::CacheHandler;
use crate::error::{ProxyError, Result};
use crate::http::resource::{classify, Classification};
use crate::http::{OriginType, ResourceType};
use crate::net::{MitmSocket, SocketId};
use crate::pool::Http2Session;
use crate::session::browser_request_matcher::BrowserRequestWait;
use crate::session::{RequestSession, SessionEvent};

/// Where a client request came from.
#[derive(Debug, Clone)]
pub struct ClientRequestInfo {
    pub is_ssl: bool,
    pub is_http2: bool,
    pub is_upgrade: bool,
    pub remote_addr: Option<SocketAddr>,
}

pub struct RequestContext {
    pub id: u64,
    pub session: Arc<RequestSession>,
    pub url: Url,
    pub method: Method,
    pub is_ssl: bool,
    pub is_upgrade: bool,
    pub is_client_http2: bool,
    pub is_server_http2: bool,
    pub is_http2_push: bool,
    pub client_remote_addr: Option<SocketAddr>,
    pub client_h2_session: Option<Arc<ClientHttp2Session>>,

    pub request_headers: HeaderMap,
    pub request_original_headers: HeaderMap,
    pub request_trailers: Option<HeaderMap>,
    pub request_post_data: BytesMut,
    pub has_request_body: bool,
    pub request_extensions: http::Extensions,
    pub request_time: SystemTime,

    pub resource_type: Option<ResourceType>,
    pub origin_type: Option<OriginType>,
    pub has_user_gesture: bool,
    pub is_user_navigation: bool,
    pub document_url: Option<String>,
    pub browser_request_id: Option<String>,
    pub browser_request: Option<BrowserRequestWait>,

    pub previous_url: Option<String>,
    pub first_redirecting_url: Option<String>,
    pub is_from_redirect: bool,
    pub redirected_to_url: Option<String>,

    pub status: u16,
    pub original_status: u16,
    pub status_message: Option<String>,
    pub response_headers: HeaderMap,
    pub response_original_headers: HeaderMap,
    pub response_trailers: Option<HeaderMap>,
    pub response_time: Option<SystemTime>,
    pub response_body: BytesMut,
    pub response_body_size: usize,

    pub dns_resolved_ip: Option<IpAddr>,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub server_alpn: Option<String>,
    pub socket: Option<Arc<MitmSocket>>,
    pub server_h2_session: Option<Http2Session>,

    pub was_intercepted: bool,
    pub cache: CacheHandler,
    pub started: Instant,
    state: ResourceState,
    state_changes: Vec<(ResourceState, Instant)>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("state", &self.state)
            .finish()
    }
}

impl RequestContext {
    /// Builds a context for a request the browser sent.
    pub fn from_client_request(
        session: Arc<RequestSession>,
        parts: &mut http::request::Parts,
        client: ClientRequestInfo,
    ) -> Result<Self> {
        let url = build_url(&parts.uri, &parts.headers, client.is_ssl, client.is_upgrade)?;
        let method = parts.method.clone();
        let cache = CacheHandler::new(session.cache(), url.as_str(), &method);
        let Classification {
            resource_type,
            origin_type,
            has_user_gesture,
            is_user_navigation,
        } = classify(&method, &url, &parts.headers, client.is_upgrade);

        let mut ctx = Self::blank(session, url, method, cache);
        ctx.is_ssl = client.is_ssl;
        ctx.is_upgrade = client.is_upgrade;
        ctx.is_client_http2 = client.is_http2;
        ctx.client_remote_addr = client.remote_addr;
        ctx.request_headers = parts.headers.clone();
        ctx.request_original_headers = parts.headers.clone();
        ctx.request_extensions = std::mem::take(&mut parts.extensions);
        ctx.resource_type = resource_type;
        ctx.origin_type = origin_type;
        ctx.has_user_gesture = has_user_gesture;
        ctx.is_user_navigation = is_user_navigation;
        ctx.set_state(ResourceState::ClientToProxyRequest);
        Ok(ctx)
    }

    /// Builds a context for a stream the server pushed alongside `parent`.
    pub fn from_http2_push(parent: &PushParent, request: &http::Request<()>) -> Result<Self> {
        let url = build_url(request.uri(), request.headers(), true, false)?;
        let method = request.method().clone();
        let cache = CacheHandler::new(parent.session.cache(), url.as_str(), &method);

        let mut ctx = Self::blank(Arc::clone(&parent.session), url, method, cache);
        ctx.is_ssl = true;
        ctx.is_client_http2 = parent.is_client_http2;
        ctx.is_server_http2 = true;
        ctx.is_http2_push = true;
        ctx.client_h2_session = parent.client_h2_session.clone();
        ctx.client_remote_addr = parent.client_remote_addr;
        ctx.request_headers = request.headers().clone();
        ctx.request_original_headers = request.headers().clone();
        ctx.document_url = parent.document_url.clone();
        ctx.origin_type = parent.origin_type;
        ctx.dns_resolved_ip = parent.dns_resolved_ip;
        ctx.local_address = parent.local_address;
        ctx.remote_address = parent.remote_address;
        ctx.server_alpn = parent.server_alpn.clone();
        ctx.socket = parent.socket.clone();
        ctx.has_user_gesture = parent.has_user_gesture;
        ctx.set_state(ResourceState::ServerToProxyPush);
        Ok(ctx)
    }

    fn blank(session: Arc<RequestSession>, url: Url, method: Method, cache: CacheHandler) -> Self {
        Self {
            id: session.next_request_id(),
            session,
            url,
            method,
            is_ssl: false,
            is_upgrade: false,
            is_client_http2: false,
            is_server_http2: false,
            is_http2_push: false,
            client_remote_addr: None,
            client_h2_session: None,
            request_headers: HeaderMap::new(),
            request_original_headers: HeaderMap::new(),
            request_trailers: None,
            request_post_data: BytesMut::new(),
            has_request_body: false,
            request_extensions: http::Extensions::new(),
            request_time: SystemTime::now(),
            resource_type: None,
            origin_type: None,
            has_user_gesture: false,
            is_user_navigation: false,
            document_url: None,
            browser_request_id: None,
            browser_request: None,
            previous_url: None,
            first_redirecting_url: None,
            is_from_redirect: false,
            redirected_to_url: None,
            status: 0,
            original_status: 0,
            status_message: None,
            response_headers: HeaderMap::new(),
            response_original_headers: HeaderMap::new(),
            response_trailers: None,
            response_time: None,
            response_body: BytesMut::new(),
            response_body_size: 0,
            dns_resolved_ip: None,
            local_address: None,
            remote_address: None,
            server_alpn: None,
            socket: None,
            server_h2_session: None,
            was_intercepted: false,
            cache,
            started: Instant::now(),
            state: ResourceState::ClientToProxyRequest,
            state_changes: Vec::new(),
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn state_changes(&self) -> &[(ResourceState, Instant)] {
        &self.state_changes
    }

    /// Moves to `state` if it lies ahead of the current one. Returns whether it moved.
    pub fn set_state(&mut self, state: ResourceState) -> bool {
        let first = self.state_changes.is_empty();
        if !first && !self.state.can_advance_to(state) {
            tracing::trace!(request_id = self.id, from = %self.state, to = %state, "Ignoring backwards state change");
            return false;
        }
        self.state = state;
        self.state_changes.push((state, Instant::now()));
        self.session.emit(SessionEvent::ResourceState {
            request_id: self.id,
            url: self.url.to_string(),
            state,
        });
        true
    }

    pub fn origin(&self) -> String {
        crate::http::headers::origin_key(&self.url)
    }

    pub fn is_websocket(&self) -> bool {
        self.is_upgrade || self.resource_type == Some(ResourceType::Websocket)
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket.as_ref().map(|socket| socket.id())
    }

    /// Copies socket metadata into the context once a socket is assigned.
    pub fn assign_socket(&mut self, socket: Arc<MitmSocket>) {
        let info = socket.info();
        self.dns_resolved_ip = info.dns_resolved_ip;
        self.local_address = info.local_addr;
        self.remote_address = info.remote_addr;
        self.server_alpn = info.alpn.clone();
        self.is_server_http2 = socket.is_http2();
        self.socket = Some(socket);
    }

    /// Waits for the browser to confirm this request, applying what it reports.
    ///
    /// Returns immediately when no confirmation is pending. Gives up after `timeout`.
    pub async fn await_browser_request(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut wait) = self.browser_request.take() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, wait.resolved()).await {
            Ok(Ok(details)) => {
                self.browser_request_id = Some(details.browser_request_id);
                if let Some(resource_type) = details.resource_type {
                    self.resource_type = Some(resource_type);
                }
                self.has_user_gesture = details.has_user_gesture;
                self.document_url = details.document_url;
                if wait.has_user_activity() {
                    if let Some(document_url) = self.document_url.as_deref().and_then(|u| Url::parse(u).ok()) {
                        self.session.record_document_user_activity(&document_url).await;
                    }
                }
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(_) => {
                tracing::warn!(
                    session_id = %self.session.id(),
                    request_id = self.id,
                    url = %self.url,
                    "Browser never confirmed request"
                );
                Ok(())
            }
        }
    }

    /// Snapshot of the fields a pushed stream inherits from this exchange.
    pub fn push_parent(&self) -> PushParent {
        PushParent {
            session: Arc::clone(&self.session),
            is_client_http2: self.is_client_http2,
            client_h2_session: self.client_h2_session.clone(),
            client_remote_addr: self.client_remote_addr,
            document_url: self.document_url.clone(),
            origin_type: self.origin_type,
            has_user_gesture: self.has_user_gesture,
            dns_resolved_ip: self.dns_resolved_ip,
            local_address: self.local_address,
            remote_address: self.remote_address,
            server_alpn: self.server_alpn.clone(),
            socket: self.socket.clone(),
        }
    }

    pub fn execution_millis(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    pub fn protocol(&self) -> &'static str {
        match (self.is_upgrade, self.is_client_http2, self.is_ssl) {
            (true, _, true) => "wss",
            (true, _, false) => "ws",
            (false, true, _) => "http2",
            (false, false, true) => "https",
            (false, false, false) => "http",
        }
    }

    /// The resource description carried by `request`, `response` and `http-error` events.
    pub fn to_emitted_resource(&self, include_body: bool) -> EmittedResource {
        let response = (self.status != 0 || self.response_time.is_some()).then(|| EmittedResponse {
            url: self.url.to_string(),
            status_code: self.original_status,
            status_message: self.status_message.clone(),
            headers: headers_to_pairs(&self.response_headers),
            trailers: self.response_trailers.as_ref().map(headers_to_pairs),
            timestamp: self.response_time.map(unix_millis),
            remote_address: self.remote_address.map(|a| a.to_string()),
            body_bytes: self.response_body_size,
        });
        let body = (include_body && !self.response_body.is_empty())
            .then(|| Bytes::copy_from_slice(&self.response_body));

        EmittedResource {
            id: self.id,
            browser_request_id: self.browser_request_id.clone(),
            url: self.url.to_string(),
            request: EmittedRequest {
                url: self.url.to_string(),
                method: self.method.to_string(),
                headers: headers_to_pairs(&self.request_headers),
                timestamp: unix_millis(self.request_time),
            },
            response,
            post_data: (!self.request_post_data.is_empty())
                .then(|| Bytes::copy_from_slice(&self.request_post_data)),
            document_url: self.document_url.clone(),
            previous_url: self.previous_url.clone(),
            first_redirecting_url: self.first_redirecting_url.clone(),
            redirected_to_url: self.redirected_to_url.clone(),
            was_cached: self.cache.should_serve_cached_data(),
            was_intercepted: self.was_intercepted,
            resource_type: self.resource_type,
            body,
            local_address: self.local_address.map(|a| a.to_string()),
            dns_resolved_ip: self.dns_resolved_ip.map(|ip| ip.to_string()),
            original_headers: headers_to_pairs(&self.request_original_headers),
            response_original_headers: headers_to_pairs(&self.response_original_headers),
            socket_id: self.socket_id().map(|id| id.as_u64()),
            protocol: self.protocol(),
            server_alpn: self.server_alpn.clone(),
            execution_millis: self.execution_millis(),
            is_http2_push: self.is_http2_push,
        }
    }
}

/// Fields a pushed stream copies from the exchange it was pushed on.
#[derive(Clone)]
pub struct PushParent {
    pub session: Arc<RequestSession>,
    pub is_client_http2: bool,
    pub client_h2_session: Option<Arc<ClientHttp2Session>>,
    pub client_remote_addr: Option<SocketAddr>,
    pub document_url: Option<String>,
    pub origin_type: Option<OriginType>,
    pub has_user_gesture: bool,
    pub dns_resolved_ip: Option<IpAddr>,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub server_alpn: Option<String>,
    pub socket: Option<Arc<MitmSocket>>,
}

/// Absolute url of a client request.
///
/// Absolute-form targets are used as given. Otherwise the scheme comes from how the
/// client connected and the authority from the uri or `Host` header.
pub fn build_url(uri: &Uri, headers: &HeaderMap, is_ssl: bool, is_upgrade: bool) -> Result<Url> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(Url::parse(&uri.to_string())?);
    }
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            headers
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| ProxyError::InvalidUrl(format!("no host for {}", uri)))?;
    let scheme = match (is_upgrade, is_ssl) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    };
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Ok(Url::parse(&format!("{}://{}{}", scheme, host, path))?)
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
