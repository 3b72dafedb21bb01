//! Correlates WebSocket upgrades with the browser's own record of them.
//!
//! The proxy sees the upgrade request, the browser reports a request id for
//! the same handshake. Both sides meet on `host,sec-websocket-key`, in either order.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use http::HeaderMap;
use tokio::sync::watch;

use crate::error::{ProxyError, Result};
use crate::sync::lock;

pub fn websocket_key(headers: &HeaderMap) -> String {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    format!("{},{}", value("host"), value("sec-websocket-key"))
}

#[derive(Debug, Default)]
pub struct WebsocketCorrelator {
    pending: Mutex<HashMap<String, watch::Sender<Option<String>>>>,
}

impl WebsocketCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the browser to report the upgrade's request id.
    pub async fn upgrade_request_id(&self, headers: &HeaderMap, timeout: Duration) -> Result<String> {
        let key = websocket_key(headers);
        let mut rx = {
            let mut pending = lock(&self.pending);
            pending
                .entry(key.clone())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };
        let waited = tokio::time::timeout(timeout, rx.wait_for(|id| id.is_some())).await;
        let id = match waited {
            Ok(Ok(id)) => id.clone(),
            Ok(Err(_)) => return Err(ProxyError::canceled("session closing")),
            Err(_) => {
                return Err(ProxyError::Timeout {
                    what: "websocket browser request id",
                    after: timeout,
                })
            }
        };
        lock(&self.pending).remove(&key);
        id.ok_or_else(|| ProxyError::canceled("session closing"))
    }

    /// Records the browser's request id for a handshake.
    pub fn register(&self, browser_request_id: &str, headers: &HeaderMap) {
        let key = websocket_key(headers);
        let mut pending = lock(&self.pending);
        let sender = pending
            .entry(key)
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(Some(browser_request_id.to_string()));
    }

    /// Drops every pending correlation, failing its waiter.
    pub fn close(&self) {
        lock(&self.pending).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn handshake() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Host", HeaderValue::from_static("chat.example.com"));
        headers.insert("Sec-WebSocket-Key", HeaderValue::from_static("dGhlIHNhbXBsZQ=="));
        headers
    }

    #[test]
    fn key_combines_host_and_websocket_key() {
        assert_eq!(websocket_key(&handshake()), "chat.example.com,dGhlIHNhbXBsZQ==");
    }

    #[tokio::test]
    async fn browser_first_then_proxy() {
        let correlator = WebsocketCorrelator::new();
        correlator.register("req-1", &handshake());
        let id = correlator
            .upgrade_request_id(&handshake(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(id, "req-1");
    }

    #[tokio::test]
    async fn proxy_first_then_browser() {
        let correlator = std::sync::Arc::new(WebsocketCorrelator::new());
        let waiting = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .upgrade_request_id(&handshake(), Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        correlator.register("req-2", &handshake());
        assert_eq!(waiting.await.unwrap().unwrap(), "req-2");
    }

    #[tokio::test]
    async fn unanswered_upgrades_time_out() {
        let correlator = WebsocketCorrelator::new();
        let err = correlator
            .upgrade_request_id(&handshake(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { .. }));
    }
}
