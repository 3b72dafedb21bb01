//! The orchestrator: drives one proxied exchange from client request to client response.
//!
//! # Responsibilities
//! - Classify the request and wait for the browser to confirm ambiguous ones
//! - Answer bypassed, intercepted and blocked requests without the network
//! - Stream the request body to the server and the response body back
//! - Feed the response through the cache and the session's hooks
//! - Turn every failure into an `http-error` event and a best-effort status
//!
//! # Data Flow
//! ```text
//! ClientToProxyRequest
//!     → DetermineResourceType (matcher, websocket correlation, browser wait)
//!     → request event → bypass / intercept?
//!     → CheckCacheOnRequest (If-None-Match)
//!     → agent.request: GetSocket → CreateProxyToServerRequest → BeforeSendRequest
//!     → WriteProxyToServerRequestBody (races socket close)
//!     → ServerToProxyOnResponse (cache, redirects)
//!     → EmulationWillSendResponse (hooks, status clamp)
//!     → WriteProxyToClientResponseBody → free socket → response event → End
//! any failure → Error + http-error event → 504 / 444 (or reset once headers are out)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderMap, HeaderValue, StatusCode};

use super::client_response::ClientResponse;
use super::push_promise;
use crate::agent::ServerRequest;
use crate::context::{RequestContext, ResourceState};
use crate::error::{ProxyError, Result};
use crate::http::body::{send_h2_data, FrameSender, IncomingBody};
use crate::http::{headers, ResourceType};
use crate::net::socket::Http1ResponseFuture;
use crate::observability::metrics;
use crate::session::browser_request_matcher::MitmResource;
use crate::session::{InterceptedResponse, SessionEvent};

/// Body served to every request of a bypassing session.
pub const EMPTY_HTML: &str = r#"<html lang="en"><body></body></html>"#;

/// Highest status forwarded to a client. Browsers accept more than hyper does.
const MAX_STATUS: u16 = 599;

/// A failure together with the leg of the exchange it happened on.
#[derive(Debug)]
pub struct Failure {
    pub kind: &'static str,
    pub error: ProxyError,
}

impl Failure {
    pub fn new(kind: &'static str, error: ProxyError) -> Self {
        Self { kind, error }
    }
}

pub trait StageExt<T> {
    /// Labels an error with where it happened.
    fn stage(self, kind: &'static str) -> std::result::Result<T, Failure>;
}

impl<T, E: Into<ProxyError>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, kind: &'static str) -> std::result::Result<T, Failure> {
        self.map_err(|error| Failure::new(kind, error.into()))
    }
}

/// Status answered for a failed exchange.
pub fn error_status(error: &ProxyError) -> StatusCode {
    if error.is_canceled() {
        StatusCode::from_u16(444).unwrap_or(StatusCode::GATEWAY_TIMEOUT)
    } else {
        StatusCode::GATEWAY_TIMEOUT
    }
}

/// Classifies the request and waits for the browser where that is useful.
pub async fn determine_resource_type(ctx: &mut RequestContext) -> Result<()> {
    ctx.set_state(ResourceState::DetermineResourceType);
    let session = Arc::clone(&ctx.session);

    if let Some(matcher) = session.browser_request_matcher() {
        let url = ctx.url.to_string();
        let method = ctx.method.to_string();
        let wait = matcher.on_mitm_requested_resource(MitmResource {
            id: ctx.id,
            url: &url,
            method: &method,
            headers: &ctx.request_headers,
            has_user_gesture: ctx.has_user_gesture,
            is_http2_push: ctx.is_http2_push,
            request_time: ctx.request_time,
        });
        ctx.browser_request = Some(wait);
    }

    // Going to be blocked anyway, no point in waiting.
    if ctx.resource_type.is_none() && session.should_intercept_request(&ctx.url, None).await {
        return Ok(());
    }

    match ctx.resource_type {
        Some(ResourceType::Websocket) => {
            let id = session.upgrade_request_id(&ctx.request_headers).await?;
            ctx.browser_request_id = Some(id);
        }
        None | Some(ResourceType::Fetch) => {
            ctx.await_browser_request(session.timeouts().browser_request()).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Where the request body goes.
enum RequestSink {
    Http1(FrameSender),
    Http2(h2::SendStream<Bytes>),
}

/// A response still on its way from the server.
enum PendingResponse {
    Http1(Http1ResponseFuture),
    Http2(h2::client::ResponseFuture),
}

impl PendingResponse {
    async fn into_response(self) -> Result<(http::response::Parts, IncomingBody)> {
        match self {
            PendingResponse::Http1(future) => {
                let response = future.await.map_err(|error| ProxyError::Http(error.into_error()))?;
                let (parts, body) = response.into_parts();
                Ok((parts, IncomingBody::Http1(body)))
            }
            PendingResponse::Http2(future) => {
                let response = future.await?;
                let (parts, body) = response.into_parts();
                Ok((parts, IncomingBody::http2(body)))
            }
        }
    }
}

pub struct HttpRequestHandler {
    ctx: RequestContext,
    client_body: IncomingBody,
    client: ClientResponse,
    socket_released: bool,
}

impl HttpRequestHandler {
    pub fn new(ctx: RequestContext, client_body: IncomingBody, client: ClientResponse) -> Self {
        Self {
            ctx,
            client_body,
            client,
            socket_released: false,
        }
    }

    /// Runs the exchange to completion. Never fails: errors are answered to the client.
    pub async fn run(mut self) {
        let outcome = AssertUnwindSafe(self.handle()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => self.on_error(failure).await,
            Err(_) => self.on_handler_panic().await,
        }
        metrics::record_request(self.ctx.protocol(), self.ctx.status, self.ctx.started);
    }

    async fn handle(&mut self) -> std::result::Result<(), Failure> {
        let session = Arc::clone(&self.ctx.session);

        if session.bypass_all_with_empty_response() {
            let response = InterceptedResponse::new(StatusCode::OK, EMPTY_HTML)
                .with_header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            return self.respond_locally(response, false).await;
        }

        // 1. Classify
        determine_resource_type(&mut self.ctx)
            .await
            .stage("ClientToProxy.SessionError")?;
        session.lookup_source_redirect(&mut self.ctx);
        session.emit(SessionEvent::Request(Box::new(self.ctx.to_emitted_resource(false))));

        // 2. Intercept or block
        if session
            .should_intercept_request(&self.ctx.url, self.ctx.resource_type)
            .await
        {
            let response = session
                .did_handle_intercept_response(&self.ctx)
                .await
                .unwrap_or_else(InterceptedResponse::blocked);
            return self.respond_locally(response, true).await;
        }

        // 3. Cache
        self.ctx.set_state(ResourceState::CheckCacheOnRequest);
        self.ctx.cache.on_request(&mut self.ctx.request_headers);

        // 4. Server request
        self.ctx.has_request_body = !self.client_body.is_end_stream();
        let server_request = session
            .agent()
            .request(&mut self.ctx)
            .await
            .stage("ProxyToServer.RequestError")?;
        let socket = self
            .ctx
            .socket
            .clone()
            .ok_or(ProxyError::SocketClosed("before request written"))
            .stage("ProxyToServer.RequestError")?;

        let (pending, sink) = match server_request {
            ServerRequest::Http1 { response, body } => (PendingResponse::Http1(response), body.map(RequestSink::Http1)),
            ServerRequest::Http2 { mut response, body } => {
                push_promise::spawn(self.ctx.push_parent(), response.push_promises(), self.client.push_responder());
                (PendingResponse::Http2(response), body.map(RequestSink::Http2))
            }
        };

        // 5. Request body
        tokio::select! {
            written = self.write_request_body(sink) => written?,
            _ = socket.closed() => {
                return Err(Failure::new(
                    "ProxyToServer.WriteError",
                    ProxyError::SocketClosed("before request written"),
                ));
            }
        }

        // 6. Response head
        let (parts, server_body) = tokio::select! {
            response = pending.into_response() => response.stage("ServerToProxy.ResponseError")?,
            _ = socket.closed() => {
                return Err(Failure::new(
                    "ServerToProxy.ResponseError",
                    ProxyError::SocketClosed("before response received"),
                ));
            }
        };
        self.on_response_head(parts);

        if self.client.is_closed() {
            tracing::warn!(
                session_id = %session.id(),
                url = %self.ctx.url,
                "Client went away before the response head"
            );
            self.release_socket(false);
            self.ctx.set_state(ResourceState::PrematurelyClosed);
            return Ok(());
        }

        // 7. Response
        self.write_response_head(&server_body)
            .await
            .stage("ServerToProxyToClient.WriteResponseHeadError")?;
        self.write_response_body(server_body).await?;

        self.release_socket(true);
        self.ctx
            .cache
            .on_response_end(&self.ctx.response_headers, self.ctx.was_intercepted);

        if let Err(error) = self
            .ctx
            .await_browser_request(session.timeouts().browser_request())
            .await
        {
            tracing::debug!(session_id = %session.id(), url = %self.ctx.url, %error, "Browser request never resolved");
        }
        self.ctx.set_state(ResourceState::End);
        session.emit(SessionEvent::Response(Box::new(self.ctx.to_emitted_resource(true))));
        Ok(())
    }

    /// Answers the client without contacting the server.
    async fn respond_locally(&mut self, response: InterceptedResponse, intercepted: bool) -> std::result::Result<(), Failure> {
        let InterceptedResponse {
            status,
            mut headers,
            body,
        } = response;
        if intercepted {
            self.ctx.set_state(ResourceState::Intercepted);
            self.ctx.was_intercepted = true;
        }
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.ctx.status = status.as_u16();
        self.ctx.original_status = status.as_u16();
        self.ctx.status_message = status.canonical_reason().map(str::to_string);
        self.ctx.response_time = Some(SystemTime::now());
        self.ctx.response_headers = headers.clone();
        self.ctx.response_original_headers = headers.clone();
        self.ctx.response_body.extend_from_slice(&body);
        self.ctx.response_body_size = body.len();

        let end_of_stream = body.is_empty();
        self.client
            .write_head(status, headers, end_of_stream)
            .await
            .stage("ProxyToClient.ResponseError")?;
        if !end_of_stream {
            self.client.write_data(body).await.stage("ProxyToClient.ResponseError")?;
            self.client.finish(None).await.stage("ProxyToClient.ResponseError")?;
        }
        self.ctx.set_state(ResourceState::End);
        if intercepted {
            self.ctx.session.emit(SessionEvent::Response(Box::new(self.ctx.to_emitted_resource(true))));
        }
        Ok(())
    }

    async fn write_request_body(&mut self, sink: Option<RequestSink>) -> std::result::Result<(), Failure> {
        self.ctx.set_state(ResourceState::WriteProxyToServerRequestBody);
        let Some(mut sink) = sink else {
            return Ok(());
        };
        while let Some(frame) = self.client_body.next_frame().await {
            let frame = frame.stage("ClientToProxy.RequestError")?;
            let frame = match frame.into_data() {
                Ok(chunk) => {
                    self.ctx.request_post_data.extend_from_slice(&chunk);
                    match &mut sink {
                        RequestSink::Http1(tx) => tx
                            .send(Ok(hyper::body::Frame::data(chunk)))
                            .await
                            .map_err(|_| ProxyError::SocketClosed("while writing request body"))
                            .stage("ProxyToServer.WriteError")?,
                        RequestSink::Http2(stream) => send_h2_data(stream, chunk, false)
                            .await
                            .stage("ProxyToServer.WriteError")?,
                    }
                    continue;
                }
                Err(frame) => frame,
            };
            if let Ok(trailers) = frame.into_trailers() {
                self.ctx.request_trailers = Some(trailers);
            }
        }

        match sink {
            RequestSink::Http1(tx) => {
                if let Some(trailers) = self.ctx.request_trailers.clone() {
                    tx.send(Ok(hyper::body::Frame::trailers(trailers)))
                        .await
                        .map_err(|_| ProxyError::SocketClosed("while writing request trailers"))
                        .stage("ProxyToServer.WriteError")?;
                }
            }
            RequestSink::Http2(mut stream) => match self.ctx.request_trailers.clone() {
                Some(trailers) => stream.send_trailers(trailers).stage("ProxyToServer.WriteError")?,
                None => stream.send_data(Bytes::new(), true).stage("ProxyToServer.WriteError")?,
            },
        }
        Ok(())
    }

    fn on_response_head(&mut self, parts: http::response::Parts) {
        let ctx = &mut self.ctx;
        ctx.set_state(ResourceState::ServerToProxyOnResponse);
        ctx.response_time = Some(SystemTime::now());
        ctx.original_status = parts.status.as_u16();
        ctx.status = ctx.original_status;
        ctx.status_message = parts.status.canonical_reason().map(str::to_string);
        ctx.response_headers = headers::clean_response_headers(&parts.headers);
        ctx.response_original_headers = parts.headers;

        ctx.set_state(ResourceState::CheckCacheOnResponseEnd);
        ctx.cache.on_response_headers(&mut ctx.status, &mut ctx.response_headers);

        if let Some(location) = headers::redirect_location(ctx.original_status, &ctx.response_original_headers, &ctx.url) {
            ctx.redirected_to_url = Some(location.to_string());
        }
        let session = Arc::clone(&ctx.session);
        session.track_resource_redirects(ctx);
    }

    async fn write_response_head(&mut self, server_body: &IncomingBody) -> Result<()> {
        let session = Arc::clone(&self.ctx.session);
        self.ctx.set_state(ResourceState::EmulationWillSendResponse);
        session.will_send_response(&mut self.ctx).await;

        if self.ctx.status > MAX_STATUS {
            tracing::info!(
                session_id = %session.id(),
                url = %self.ctx.url,
                actual_status = self.ctx.status,
                response_status = MAX_STATUS,
                "Clamping response status"
            );
            self.ctx.status = MAX_STATUS;
        }
        let status = StatusCode::from_u16(self.ctx.status).map_err(http::Error::from)?;
        let headers: HeaderMap = if self.client.is_http2() {
            headers::prepare_http2_response_headers(&self.ctx.response_headers)
        } else {
            self.ctx.response_headers.clone()
        };
        let end_of_stream = server_body.is_end_stream() && !self.ctx.cache.should_serve_cached_data();
        self.client.write_head(status, headers, end_of_stream).await
    }

    async fn write_response_body(&mut self, mut server_body: IncomingBody) -> std::result::Result<(), Failure> {
        self.ctx.set_state(ResourceState::WriteProxyToClientResponseBody);
        let mut trailers = None;
        while let Some(frame) = server_body.next_frame().await {
            let frame = frame.stage("ServerToProxy.ResponseError")?;
            match frame.into_data() {
                Ok(chunk) => {
                    if let Some(chunk) = self.ctx.cache.on_response_data(chunk) {
                        self.ctx.response_body.extend_from_slice(&chunk);
                        self.ctx.response_body_size += chunk.len();
                        self.client
                            .write_data(chunk)
                            .await
                            .stage("ServerToProxy.WriteResponseError")?;
                    }
                }
                Err(frame) => trailers = frame.into_trailers().ok(),
            }
        }

        if let Some(cached) = self.ctx.cache.cached_data() {
            self.ctx.response_body.extend_from_slice(&cached);
            self.ctx.response_body_size += cached.len();
            self.client
                .write_data(cached)
                .await
                .stage("ServerToProxy.WriteCachedResponseError")?;
        }

        self.ctx.response_trailers = trailers.clone();
        self.client
            .finish(trailers)
            .await
            .stage("ProxyToClient.ResponseError")?;
        Ok(())
    }

    /// Hands the socket back to the pool after a complete exchange, or closes it.
    fn release_socket(&mut self, completed: bool) {
        if self.socket_released {
            return;
        }
        self.socket_released = true;
        if completed {
            self.ctx.session.agent().free_socket(&self.ctx);
            return;
        }
        // An HTTP/1.1 socket in an unknown state can't be reused. HTTP/2 sessions stay up.
        if let Some(socket) = &self.ctx.socket {
            if !self.ctx.is_server_http2 {
                socket.close();
            }
        }
    }

    async fn on_error(&mut self, failure: Failure) {
        let Failure { kind, error } = failure;
        let session = Arc::clone(&self.ctx.session);
        let canceled = error.is_canceled();
        self.release_socket(false);

        self.ctx.set_state(ResourceState::Error);
        session.emit(SessionEvent::HttpError {
            request: Box::new(self.ctx.to_emitted_resource(false)),
            kind,
            error: error.to_string(),
        });
        metrics::record_http_error(kind);

        if !canceled && !session.is_closing() {
            tracing::info!(
                session_id = %session.id(),
                request = %format!("{}: {}", self.ctx.method, self.ctx.url),
                %error,
                "MitmHttpRequest.{}",
                kind
            );
        } else {
            tracing::debug!(session_id = %session.id(), url = %self.ctx.url, kind, %error, "Request canceled");
        }

        let status = error_status(&error);
        self.ctx.status = status.as_u16();
        let message = session
            .respond_with_http_error_stacks()
            .then(|| format!("{}: {}", kind, error));
        self.client.send_error(status, message).await;
    }

    async fn on_handler_panic(&mut self) {
        tracing::warn!(
            session_id = %self.ctx.session.id(),
            url = %self.ctx.url,
            "MitmHttpRequest.ClientToProxy.HandlerError"
        );
        self.release_socket(false);
        self.ctx.set_state(ResourceState::Error);
        self.ctx.status = StatusCode::BAD_REQUEST.as_u16();
        self.client.send_error(StatusCode::BAD_REQUEST, None).await;
    }
}
