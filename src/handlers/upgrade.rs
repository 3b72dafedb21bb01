//! WebSocket (and other HTTP/1.1 `Upgrade`) requests.
//!
//! # Data Flow
//! ```text
//! client Upgrade request (hyper OnUpgrade taken before the context is built)
//!     → DetermineResourceType: wait for the browser's websocket request id
//!     → request event → blocked? 404
//!     → agent.request on a dedicated, unpooled socket
//!     → server 101? relay the head, then splice client ⇄ server byte streams
//!     → anything else: forwarded like a normal response
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use http::{HeaderValue, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use super::client_response::ClientResponse;
use super::http_request::{determine_resource_type, error_status, Failure, StageExt};
use crate::agent::ServerRequest;
use crate::context::{RequestContext, ResourceState};
use crate::error::ProxyError;
use crate::http::body::IncomingBody;
use crate::http::headers;
use crate::observability::metrics;
use crate::session::{InterceptedResponse, SessionEvent};

pub struct HttpUpgradeHandler {
    ctx: RequestContext,
    client_upgrade: Option<OnUpgrade>,
    client: ClientResponse,
}

impl HttpUpgradeHandler {
    pub fn new(ctx: RequestContext, client_upgrade: OnUpgrade, client: ClientResponse) -> Self {
        Self {
            ctx,
            client_upgrade: Some(client_upgrade),
            client,
        }
    }

    pub async fn run(mut self) {
        let session = Arc::clone(&self.ctx.session);
        if let Err(Failure { kind, error }) = self.handle().await {
            if let Some(socket) = &self.ctx.socket {
                socket.close();
            }
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
                    request = %format!("UPGRADE: {}", self.ctx.url),
                    %error,
                    "MitmHttpRequest.{}",
                    kind
                );
            }
            let status = error_status(&error);
            self.ctx.status = status.as_u16();
            let message = session
                .respond_with_http_error_stacks()
                .then(|| format!("{}: {}", kind, error));
            self.client.send_error(status, message).await;
        }
        metrics::record_request(self.ctx.protocol(), self.ctx.status, self.ctx.started);
    }

    async fn handle(&mut self) -> std::result::Result<(), Failure> {
        let session = Arc::clone(&self.ctx.session);

        determine_resource_type(&mut self.ctx)
            .await
            .stage("ClientToProxy.UpgradeSessionError")?;
        session.lookup_source_redirect(&mut self.ctx);
        session.emit(SessionEvent::Request(Box::new(self.ctx.to_emitted_resource(false))));

        if session
            .should_intercept_request(&self.ctx.url, self.ctx.resource_type)
            .await
        {
            let InterceptedResponse { status, headers, body } = session
                .did_handle_intercept_response(&self.ctx)
                .await
                .unwrap_or_else(InterceptedResponse::blocked);
            self.ctx.set_state(ResourceState::Intercepted);
            self.ctx.was_intercepted = true;
            self.ctx.status = status.as_u16();
            self.ctx.original_status = status.as_u16();
            self.ctx.response_headers = headers.clone();
            self.ctx.response_time = Some(SystemTime::now());
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
            session.emit(SessionEvent::Response(Box::new(self.ctx.to_emitted_resource(false))));
            return Ok(());
        }

        let server_request = session
            .agent()
            .request(&mut self.ctx)
            .await
            .stage("ProxyToServer.UpgradeRequestError")?;
        self.ctx.set_state(ResourceState::WriteProxyToServerRequestBody);
        let response = match server_request {
            ServerRequest::Http1 { response, .. } => response
                .await
                .map_err(|error| ProxyError::Http(error.into_error()))
                .stage("ServerToProxy.UpgradeResponseError")?,
            ServerRequest::Http2 { .. } => {
                return Err(Failure::new(
                    "ProxyToServer.UpgradeRequestError",
                    ProxyError::SocketClosed("upgrade landed on an http2 socket"),
                ));
            }
        };

        self.ctx.set_state(ResourceState::ServerToProxyOnResponse);
        self.ctx.response_time = Some(SystemTime::now());
        self.ctx.original_status = response.status().as_u16();
        self.ctx.status = self.ctx.original_status;
        self.ctx.status_message = response.status().canonical_reason().map(str::to_string);
        self.ctx.response_headers = headers::clean_response_headers(response.headers());
        self.ctx.response_original_headers = response.headers().clone();

        self.ctx.set_state(ResourceState::EmulationWillSendResponse);
        session.will_send_response(&mut self.ctx).await;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return self.forward_refusal(response).await;
        }

        let server_upgrade = hyper::upgrade::on(response);
        self.client
            .write_head(StatusCode::SWITCHING_PROTOCOLS, self.ctx.response_headers.clone(), true)
            .await
            .stage("ProxyToClient.UpgradeResponseError")?;
        self.ctx.set_state(ResourceState::WriteProxyToClientResponseBody);
        session.emit(SessionEvent::Response(Box::new(self.ctx.to_emitted_resource(false))));

        let client_upgrade = self
            .client_upgrade
            .take()
            .ok_or(ProxyError::SocketClosed("client upgrade already taken"))
            .stage("ClientToProxy.UpgradeError")?;
        let (client_io, server_io) = tokio::try_join!(client_upgrade, server_upgrade)
            .stage("ClientToProxy.UpgradeError")?;
        let mut client_io = TokioIo::new(client_io);
        let mut server_io = TokioIo::new(server_io);

        tracing::debug!(session_id = %session.id(), url = %self.ctx.url, "WebSocket connected");
        let spliced = tokio::select! {
            spliced = tokio::io::copy_bidirectional(&mut client_io, &mut server_io) => spliced,
            _ = session.closed() => Ok((0, 0)),
        };
        match spliced {
            Ok((to_server, to_client)) => {
                tracing::debug!(session_id = %session.id(), url = %self.ctx.url, to_server, to_client, "WebSocket closed");
            }
            Err(error) => {
                tracing::debug!(session_id = %session.id(), url = %self.ctx.url, %error, "WebSocket ended with error");
            }
        }
        if let Some(socket) = &self.ctx.socket {
            socket.close();
        }
        self.ctx.set_state(ResourceState::End);
        Ok(())
    }

    /// The server declined to switch protocols: pass its answer along.
    async fn forward_refusal(&mut self, response: http::Response<hyper::body::Incoming>) -> std::result::Result<(), Failure> {
        let (_, body) = response.into_parts();
        let mut body = IncomingBody::Http1(body);
        let status = StatusCode::from_u16(self.ctx.status.min(599))
            .map_err(http::Error::from)
            .stage("ServerToProxyToClient.WriteResponseHeadError")?;
        let mut headers = self.ctx.response_headers.clone();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        self.client
            .write_head(status, headers, body.is_end_stream())
            .await
            .stage("ServerToProxyToClient.WriteResponseHeadError")?;

        self.ctx.set_state(ResourceState::WriteProxyToClientResponseBody);
        while let Some(frame) = body.next_frame().await {
            let frame = frame.stage("ServerToProxy.ResponseError")?;
            if let Ok(chunk) = frame.into_data() {
                self.ctx.response_body.extend_from_slice(&chunk);
                self.ctx.response_body_size += chunk.len();
                self.client
                    .write_data(chunk)
                    .await
                    .stage("ServerToProxy.WriteResponseError")?;
            }
        }
        self.client.finish(None).await.stage("ProxyToClient.ResponseError")?;
        if let Some(socket) = &self.ctx.socket {
            socket.close();
        }
        self.ctx.set_state(ResourceState::End);
        self.ctx
            .session
            .emit(SessionEvent::Response(Box::new(self.ctx.to_emitted_resource(true))));
        Ok(())
    }
}
