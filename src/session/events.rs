//! Events a session publishes to its subscribers.

use crate::context::{EmittedResource, ResourceState};
use crate::net::SocketInfo;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A request is about to go to the network (or be intercepted).
    Request(Box<EmittedResource>),
    /// A response finished, including its body.
    Response(Box<EmittedResource>),
    HttpError {
        request: Box<EmittedResource>,
        /// Where it failed, e.g. `ServerToProxy.ResponseError`.
        kind: &'static str,
        error: String,
    },
    SocketConnect(SocketInfo),
    SocketClose(SocketInfo),
    ResourceState {
        request_id: u64,
        url: String,
        state: ResourceState,
    },
    Close,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Request(_) => "request",
            SessionEvent::Response(_) => "response",
            SessionEvent::HttpError { .. } => "http-error",
            SessionEvent::SocketConnect(_) => "socket-connect",
            SessionEvent::SocketClose(_) => "socket-close",
            SessionEvent::ResourceState { .. } => "resource-state",
            SessionEvent::Close => "close",
        }
    }
}
