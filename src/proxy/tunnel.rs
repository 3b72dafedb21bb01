//! `CONNECT` tunnels into the proxy's own listeners.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port (already answered 200)
//!     → read the first bytes the browser sends
//!     → 0x16 (TLS ClientHello)?
//!         ├─ yes: ALPN probe of host:port ∥ certificate for host
//!         │       → h2 ? HTTP/2 listener : TLS listener
//!         └─ no:  plain HTTP listener
//!     → loopback connect, record local port → session id
//!     → replay the first bytes, then splice both directions
//! ```
//!
//! # Design Decisions
//! - Hosts the session already intercepts, and bypass sessions, skip the ALPN
//!   probe and are served over HTTP/1.1
//! - Every tunnel is tracked so closing the proxy tears it down

use std::net::SocketAddr;
use std::sync::Arc;

use http::uri::Authority;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::server::ProxyShared;
use crate::error::{ProxyError, Result};
use crate::session::RequestSession;

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;
const PEEK_BUFFER: usize = 4096;

/// Runs one tunnel after hyper hands over the upgraded connection.
pub(crate) async fn run(
    shared: Arc<ProxyShared>,
    session: Arc<RequestSession>,
    authority: Authority,
    upgrade: OnUpgrade,
) {
    let client = match upgrade.await {
        Ok(upgraded) => TokioIo::new(upgraded),
        Err(error) => {
            tracing::debug!(session_id = %session.id(), host = %authority, %error, "CONNECT upgrade failed");
            return;
        }
    };
    if let Err(error) = tunnel(&shared, &session, &authority, client).await {
        if error.is_canceled() || session.is_closing() || shared.is_closing() {
            tracing::debug!(session_id = %session.id(), host = %authority, %error, "Tunnel closed during shutdown");
        } else {
            tracing::info!(session_id = %session.id(), host = %authority, %error, "MitmProxy.TunnelError");
        }
    }
}

async fn tunnel<C>(
    shared: &ProxyShared,
    session: &Arc<RequestSession>,
    authority: &Authority,
    mut client: C,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if session.is_closing() {
        return Err(ProxyError::canceled("session closing"));
    }
    let host = authority.host().trim_start_matches('[').trim_end_matches(']').to_string();
    let port = authority.port_u16().unwrap_or(443);

    let mut head = vec![0u8; PEEK_BUFFER];
    let read = client.read(&mut head).await?;
    if read == 0 {
        return Ok(());
    }
    head.truncate(read);

    let target = if head[0] == TLS_HANDSHAKE {
        let (is_http2, context) = tokio::join!(
            is_http2(session, &host, port),
            shared.certificates.add_secure_context(&host)
        );
        context?;
        if is_http2 {
            shared.http2_addr
        } else {
            shared.https_addr
        }
    } else {
        shared.http_addr
    };
    if session.is_closing() {
        return Err(ProxyError::canceled("session closing"));
    }

    let mut server = TcpStream::connect(target).await?;
    server.set_nodelay(true)?;
    let local_port = server.local_addr()?.port();
    shared.registry.register_port(local_port, session.id());
    shared.registry.register_tunnel_host(local_port, &host);
    tracing::trace!(session_id = %session.id(), host = %host, local_port, target = %target, "Tunnel established");

    let (_guard, kill) = shared.tunnels.track();
    let spliced = async {
        server.write_all(&head).await?;
        tokio::io::copy_bidirectional(&mut client, &mut server).await
    };
    let result = tokio::select! {
        spliced = spliced => spliced.map(|_| ()).map_err(ProxyError::from),
        _ = kill => Ok(()),
        _ = session.closed() => Ok(()),
    };
    shared.registry.unregister_port(local_port);
    result
}

/// Whether the browser should be routed to the HTTP/2 listener for `host:port`.
async fn is_http2(session: &Arc<RequestSession>, host: &str, port: u16) -> bool {
    if session.bypass_all_with_empty_response() || session.intercepts_host(host) {
        return false;
    }
    match session.agent().is_host_alpn_h2(session, host, port).await {
        Ok(is_http2) => is_http2,
        Err(error) if error.is_canceled() => false,
        Err(error) => {
            tracing::warn!(session_id = %session.id(), host, port, %error, "Connect.AlpnLookupError");
            false
        }
    }
}

/// Loopback address for a listener bound to `addr` (unspecified binds become localhost).
pub(crate) fn loopback_target(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from((std::net::Ipv4Addr::LOCALHOST, v4.port()))
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, v6.port()))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_binds_loop_back_to_localhost() {
        let any: SocketAddr = "0.0.0.0:8443".parse().unwrap();
        assert_eq!(loopback_target(any), "127.0.0.1:8443".parse().unwrap());
        let any6: SocketAddr = "[::]:8443".parse().unwrap();
        assert_eq!(loopback_target(any6), "[::1]:8443".parse().unwrap());
        let fixed: SocketAddr = "127.0.0.2:1".parse().unwrap();
        assert_eq!(loopback_target(fixed), fixed);
    }
}
