//! Body plumbing shared by both legs of an exchange.
//!
//! Incoming bodies (client requests, server responses) arrive either from hyper
//! (HTTP/1.1) or from an h2 stream. `IncomingBody` reads both as a sequence of
//! frames. Outgoing hyper bodies are fed through a bounded channel.

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{BoxError, ProxyError, Result};

/// Body type handed to hyper in both directions.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Producer half of a channel-backed `ProxyBody`.
pub type FrameSender = mpsc::Sender<std::result::Result<Frame<Bytes>, BoxError>>;

const BODY_CHANNEL_CAPACITY: usize = 32;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A streaming body fed by the returned sender. Dropping the sender ends the body.
pub fn channel() -> (FrameSender, ProxyBody) {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    (tx, StreamBody::new(ReceiverStream::new(rx)).boxed())
}

/// A message body being read from a peer.
pub enum IncomingBody {
    Http1(Incoming),
    Http2 { stream: h2::RecvStream, data_done: bool },
    Empty,
}

impl IncomingBody {
    pub fn http2(stream: h2::RecvStream) -> Self {
        IncomingBody::Http2 {
            stream,
            data_done: false,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        match self {
            IncomingBody::Http1(body) => body.is_end_stream(),
            IncomingBody::Http2 { stream, .. } => stream.is_end_stream(),
            IncomingBody::Empty => true,
        }
    }

    /// Reads the next data or trailers frame. `None` once the body is complete.
    pub async fn next_frame(&mut self) -> Option<Result<Frame<Bytes>>> {
        match self {
            IncomingBody::Empty => None,
            IncomingBody::Http1(body) => match body.frame().await {
                Some(Ok(frame)) => Some(Ok(frame)),
                Some(Err(e)) => Some(Err(ProxyError::Http(e))),
                None => {
                    *self = IncomingBody::Empty;
                    None
                }
            },
            IncomingBody::Http2 { stream, data_done } => {
                if !*data_done {
                    match stream.data().await {
                        Some(Ok(chunk)) => {
                            let _ = stream.flow_control().release_capacity(chunk.len());
                            return Some(Ok(Frame::data(chunk)));
                        }
                        Some(Err(e)) => return Some(Err(e.into())),
                        None => *data_done = true,
                    }
                }
                let trailers = stream.trailers().await;
                *self = IncomingBody::Empty;
                match trailers {
                    Ok(Some(trailers)) => Some(Ok(Frame::trailers(trailers))),
                    Ok(None) => None,
                    Err(e) => Some(Err(e.into())),
                }
            }
        }
    }

    /// Reads the rest of the body into memory, returning data and trailers.
    pub async fn collect(mut self) -> Result<(Bytes, Option<HeaderMap>)> {
        let mut data = bytes::BytesMut::new();
        let mut trailers = None;
        while let Some(frame) = self.next_frame().await {
            match frame?.into_data() {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(frame) => trailers = frame.into_trailers().ok(),
            }
        }
        Ok((data.freeze(), trailers))
    }
}

/// Writes data to an h2 send stream, waiting for flow-control capacity.
pub async fn send_h2_data(
    stream: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<()> {
    if data.is_empty() {
        if end_of_stream {
            stream.send_data(Bytes::new(), true)?;
        }
        return Ok(());
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = std::future::poll_fn(|cx| stream.poll_capacity(cx)).await;
        match granted {
            Some(Ok(0)) => continue,
            Some(Ok(n)) => {
                let chunk = data.split_to(n.min(data.len()));
                stream.send_data(chunk, end_of_stream && data.is_empty())?;
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProxyError::SocketClosed("while writing http2 data")),
        }
    }
    Ok(())
}
