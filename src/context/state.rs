//! Protocol state of one exchange.

use serde::Serialize;

/// Where an exchange is in its lifecycle.
///
/// Declaration order is the only order states may be entered in, except that
/// `Error` and `PrematurelyClosed` can be entered from anywhere, repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResourceState {
    ClientToProxyRequest,
    ServerToProxyPush,
    DetermineResourceType,
    CheckCacheOnRequest,
    GetSocket,
    CreateProxyToServerRequest,
    BeforeSendRequest,
    CreateH2Session,
    WriteProxyToServerRequestBody,
    ServerToProxyOnResponse,
    ProxyToClientPush,
    ProxyToClientPushResponse,
    ServerToProxyPushResponse,
    CheckCacheOnResponseEnd,
    Intercepted,
    EmulationWillSendResponse,
    WriteProxyToClientResponseBody,
    End,
    Error,
    PrematurelyClosed,
}

impl ResourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceState::End | ResourceState::Error | ResourceState::PrematurelyClosed
        )
    }

    fn is_failure(&self) -> bool {
        matches!(self, ResourceState::Error | ResourceState::PrematurelyClosed)
    }

    /// Whether `next` may follow `self`.
    pub fn can_advance_to(&self, next: ResourceState) -> bool {
        next.is_failure() || (!self.is_failure() && next > *self)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
