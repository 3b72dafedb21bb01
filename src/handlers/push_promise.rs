//! Streams the server pushes alongside an HTTP/2 exchange.
//!
//! # Data Flow
//! ```text
//! server PUSH_PROMISE on a parent stream
//!     → RequestContext::from_http2_push (inherits the parent's socket, document)
//!     → request event → blocked? cancel the push
//!     → client is HTTP/2? push_request on the parent's client stream : cancel
//!     → pushed response head → cache check (replay a cached body on ETag match)
//!     → stream body + trailers to the client → response event
//! ```
//!
//! # Design Decisions
//! - Dropping an h2 client push cancels it (RST_STREAM CANCEL); that is how
//!   blocked, refused and cache-served pushes are turned away

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::{Request, Response, StatusCode};

use super::client_response::SharedSendResponse;
use super::http_request::determine_resource_type;
use crate::context::{PushParent, RequestContext, ResourceState};
use crate::error::{ProxyError, Result};
use crate::http::body::{send_h2_data, IncomingBody};
use crate::http::headers;
use crate::observability::metrics;
use crate::session::SessionEvent;

/// Handles every push promised on a parent stream, each on its own task.
pub fn spawn(parent: PushParent, mut promises: h2::client::PushPromises, client: Option<SharedSendResponse>) {
    tokio::spawn(async move {
        while let Some(promise) = promises.push_promise().await {
            match promise {
                Ok(promise) => {
                    let (request, response) = promise.into_parts();
                    match RequestContext::from_http2_push(&parent, &request) {
                        Ok(ctx) => {
                            let handler = Http2PushHandler {
                                ctx,
                                response: Some(response),
                                client: client.clone(),
                            };
                            tokio::spawn(handler.run());
                        }
                        Err(error) => {
                            tracing::debug!(session_id = %parent.session.id(), %error, "Ignoring unparseable push");
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(session_id = %parent.session.id(), %error, "Push promise stream ended");
                    break;
                }
            }
        }
    });
}

struct Http2PushHandler {
    ctx: RequestContext,
    response: Option<h2::client::PushedResponseFuture>,
    client: Option<SharedSendResponse>,
}

impl Http2PushHandler {
    async fn run(mut self) {
        let session = Arc::clone(&self.ctx.session);
        tracing::info!(
            session_id = %session.id(),
            url = %self.ctx.url,
            "Http2Client.pushReceived"
        );
        session.lookup_source_redirect(&mut self.ctx);
        session.emit(SessionEvent::Request(Box::new(self.ctx.to_emitted_resource(false))));

        if session
            .should_intercept_request(&self.ctx.url, self.ctx.resource_type)
            .await
        {
            self.ctx.was_intercepted = true;
            self.ctx.set_state(ResourceState::Intercepted);
            session.emit(SessionEvent::Response(Box::new(self.ctx.to_emitted_resource(false))));
            return;
        }

        let Some(client) = self.client.take() else {
            tracing::debug!(session_id = %session.id(), url = %self.ctx.url, "Refusing push to an HTTP/1 client");
            self.ctx.set_state(ResourceState::PrematurelyClosed);
            return;
        };

        if let Err(error) = self.forward(client).await {
            self.on_push_error(error);
        }
    }

    async fn forward(&mut self, client: SharedSendResponse) -> Result<()> {
        let session = Arc::clone(&self.ctx.session);
        self.ctx.request_headers = headers::clean_push_headers(&self.ctx.request_original_headers);

        // 1. Promise the stream to the browser
        self.ctx.set_state(ResourceState::ProxyToClientPush);
        let mut request = Request::builder()
            .method(self.ctx.method.clone())
            .uri(self.ctx.url.as_str())
            .body(())?;
        *request.headers_mut() = self.ctx.request_headers.clone();
        let pushed = client.lock().await.push_request(request);
        let mut pushed = match pushed {
            Ok(pushed) => pushed,
            Err(error) => {
                tracing::warn!(session_id = %session.id(), url = %self.ctx.url, %error, "Http2.ClientToProxy.CreatePushStreamError");
                return Ok(());
            }
        };

        // 2. Wait for the server's pushed response
        self.ctx.set_state(ResourceState::ProxyToClientPushResponse);
        let response = self
            .response
            .take()
            .ok_or(ProxyError::SocketClosed("before push response"))?
            .await?;
        let (parts, body) = response.into_parts();
        self.ctx.response_time = Some(SystemTime::now());
        self.ctx.original_status = parts.status.as_u16();
        self.ctx.status = self.ctx.original_status;
        self.ctx.status_message = parts.status.canonical_reason().map(str::to_string);
        self.ctx.response_headers = headers::clean_response_headers(&parts.headers);
        self.ctx.response_original_headers = parts.headers;
        self.ctx
            .cache
            .on_http2_push_stream(&mut self.ctx.status, &mut self.ctx.response_headers);

        let status = StatusCode::from_u16(self.ctx.status).map_err(http::Error::from)?;
        let mut head = Response::new(());
        *head.status_mut() = status;
        *head.headers_mut() = headers::prepare_http2_response_headers(&self.ctx.response_headers);

        // 3. Body, from the cache or the server
        if let Some(cached) = self.ctx.cache.cached_data() {
            drop(body);
            self.ctx.response_body.extend_from_slice(&cached);
            self.ctx.response_body_size = cached.len();
            let mut stream = pushed.send_response(head, cached.is_empty())?;
            if !cached.is_empty() {
                send_h2_data(&mut stream, cached, true).await?;
            }
        } else {
            self.ctx.set_state(ResourceState::ServerToProxyPushResponse);
            let mut body = IncomingBody::http2(body);
            if body.is_end_stream() {
                pushed.send_response(head, true)?;
                return self.finish().await;
            }
            let mut stream = pushed.send_response(head, false)?;
            let mut trailers = None;
            while let Some(frame) = body.next_frame().await {
                match frame?.into_data() {
                    Ok(chunk) => {
                        if let Some(chunk) = self.ctx.cache.on_response_data(chunk) {
                            self.ctx.response_body.extend_from_slice(&chunk);
                            self.ctx.response_body_size += chunk.len();
                            send_h2_data(&mut stream, chunk, false).await?;
                        }
                    }
                    Err(frame) => trailers = frame.into_trailers().ok(),
                }
            }
            self.ctx.response_trailers = trailers.clone();
            match trailers {
                Some(trailers) => stream.send_trailers(trailers)?,
                None => stream.send_data(Bytes::new(), true)?,
            }
        }
        self.finish().await
    }

    async fn finish(&mut self) -> Result<()> {
        let session = Arc::clone(&self.ctx.session);
        self.ctx
            .cache
            .on_response_end(&self.ctx.response_headers, false);

        if let Err(error) = determine_resource_type(&mut self.ctx).await {
            tracing::debug!(session_id = %session.id(), url = %self.ctx.url, %error, "Push never matched a browser load");
        }
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

    fn on_push_error(&mut self, error: ProxyError) {
        let session = Arc::clone(&self.ctx.session);
        let kind = "Http2PushProxyToClient.WriteError";
        self.ctx.set_state(ResourceState::Error);
        session.emit(SessionEvent::HttpError {
            request: Box::new(self.ctx.to_emitted_resource(false)),
            kind,
            error: error.to_string(),
        });
        metrics::record_http_error(kind);
        if !error.is_canceled() && !session.is_closing() {
            tracing::info!(
                session_id = %session.id(),
                request = %format!("H2PUSH: {}", self.ctx.url),
                %error,
                "MitmHttpRequest.{}",
                kind
            );
        }
    }
}
