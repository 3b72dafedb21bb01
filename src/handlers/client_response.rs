//! The proxy-to-client half of an exchange.
//!
//! HTTP/1.1 responses go back through hyper: the head travels on a oneshot to the
//! connection's service future, the body through a frame channel. HTTP/2 responses
//! are written straight to the browser's h2 stream.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use hyper::body::Frame;
use tokio::sync::{oneshot, Mutex};

use crate::error::{ProxyError, Result};
use crate::http::body::{self, send_h2_data, FrameSender, ProxyBody};

/// Browser-side responder of an HTTP/2 stream. Shared with the push handler.
pub type SharedSendResponse = Arc<Mutex<h2::server::SendResponse<Bytes>>>;

pub enum ClientResponse {
    Http1 {
        head: Option<oneshot::Sender<Response<ProxyBody>>>,
        body: Option<FrameSender>,
        headers_sent: bool,
    },
    Http2 {
        respond: SharedSendResponse,
        stream: Option<h2::SendStream<Bytes>>,
        headers_sent: bool,
    },
}

impl std::fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, headers_sent) = match self {
            ClientResponse::Http1 { headers_sent, .. } => ("http1", headers_sent),
            ClientResponse::Http2 { headers_sent, .. } => ("http2", headers_sent),
        };
        f.debug_struct("ClientResponse")
            .field("kind", &kind)
            .field("headers_sent", headers_sent)
            .finish()
    }
}

impl ClientResponse {
    /// Returns the responder and the receiver hyper's service future waits on.
    pub fn http1() -> (Self, oneshot::Receiver<Response<ProxyBody>>) {
        let (tx, rx) = oneshot::channel();
        (
            ClientResponse::Http1 {
                head: Some(tx),
                body: None,
                headers_sent: false,
            },
            rx,
        )
    }

    pub fn http2(respond: h2::server::SendResponse<Bytes>) -> Self {
        Self::http2_shared(Arc::new(Mutex::new(respond)))
    }

    pub fn http2_shared(respond: SharedSendResponse) -> Self {
        ClientResponse::Http2 {
            respond,
            stream: None,
            headers_sent: false,
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, ClientResponse::Http2 { .. })
    }

    pub fn headers_sent(&self) -> bool {
        match self {
            ClientResponse::Http1 { headers_sent, .. } | ClientResponse::Http2 { headers_sent, .. } => {
                *headers_sent
            }
        }
    }

    /// True when the browser is known to be gone.
    pub fn is_closed(&self) -> bool {
        match self {
            ClientResponse::Http1 { head: Some(head), .. } => head.is_closed(),
            ClientResponse::Http1 { body: Some(body), .. } => body.is_closed(),
            ClientResponse::Http1 { headers_sent, .. } => *headers_sent,
            ClientResponse::Http2 { .. } => false,
        }
    }

    /// The responder HTTP/2 pushes are promised on.
    pub fn push_responder(&self) -> Option<SharedSendResponse> {
        match self {
            ClientResponse::Http2 { respond, .. } => Some(Arc::clone(respond)),
            ClientResponse::Http1 { .. } => None,
        }
    }

    /// Sends the status line and headers. With `end_of_stream` no body follows.
    pub async fn write_head(&mut self, status: StatusCode, headers: HeaderMap, end_of_stream: bool) -> Result<()> {
        match self {
            ClientResponse::Http1 {
                head,
                body,
                headers_sent,
            } => {
                let head = head.take().ok_or(ProxyError::SocketClosed("response head already sent"))?;
                let response_body = if end_of_stream {
                    body::empty()
                } else {
                    let (tx, rx) = body::channel();
                    *body = Some(tx);
                    rx
                };
                let mut response = Response::new(response_body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                *headers_sent = true;
                head.send(response)
                    .map_err(|_| ProxyError::SocketClosed("client went away before response head"))
            }
            ClientResponse::Http2 {
                respond,
                stream,
                headers_sent,
            } => {
                let mut response = Response::new(());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                let sent = respond.lock().await.send_response(response, end_of_stream)?;
                *headers_sent = true;
                if !end_of_stream {
                    *stream = Some(sent);
                }
                Ok(())
            }
        }
    }

    pub async fn write_data(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            ClientResponse::Http1 { body, .. } => {
                let body = body.as_ref().ok_or(ProxyError::SocketClosed("response body"))?;
                body.send(Ok(Frame::data(data)))
                    .await
                    .map_err(|_| ProxyError::SocketClosed("client went away during response body"))
            }
            ClientResponse::Http2 { stream, .. } => {
                let stream = stream.as_mut().ok_or(ProxyError::SocketClosed("response body"))?;
                send_h2_data(stream, data, false).await
            }
        }
    }

    /// Ends the response, sending trailers when there are any.
    pub async fn finish(&mut self, trailers: Option<HeaderMap>) -> Result<()> {
        match self {
            ClientResponse::Http1 { body, .. } => {
                if let (Some(sender), Some(trailers)) = (body.as_ref(), trailers) {
                    sender
                        .send(Ok(Frame::trailers(trailers)))
                        .await
                        .map_err(|_| ProxyError::SocketClosed("client went away before trailers"))?;
                }
                body.take();
                Ok(())
            }
            ClientResponse::Http2 { stream, .. } => {
                let Some(mut stream) = stream.take() else {
                    return Ok(());
                };
                match trailers {
                    Some(trailers) if !trailers.is_empty() => stream.send_trailers(trailers)?,
                    _ => stream.send_data(Bytes::new(), true)?,
                }
                Ok(())
            }
        }
    }

    /// Best-effort error answer. Once headers are out, only the stream is torn down.
    pub async fn send_error(&mut self, status: StatusCode, message: Option<String>) {
        if !self.headers_sent() {
            let body = Bytes::from(message.unwrap_or_default());
            let mut headers = HeaderMap::new();
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
            headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            let end_of_stream = body.is_empty();
            if self.write_head(status, headers, end_of_stream).await.is_ok() && !end_of_stream {
                let _ = self.write_data(body).await;
                let _ = self.finish(None).await;
            }
            return;
        }
        self.abort().await;
    }

    /// Tears the response down mid-body.
    pub async fn abort(&mut self) {
        match self {
            ClientResponse::Http1 { body, .. } => {
                if let Some(sender) = body.take() {
                    let _ = sender
                        .send(Err(Box::new(ProxyError::canceled("response aborted")) as crate::error::BoxError))
                        .await;
                }
            }
            ClientResponse::Http2 { stream, respond, .. } => match stream.take() {
                Some(mut stream) => stream.send_reset(h2::Reason::INTERNAL_ERROR),
                None => respond.lock().await.send_reset(h2::Reason::INTERNAL_ERROR),
            },
        }
    }
}
