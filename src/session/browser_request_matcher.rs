//! Pairs proxied requests with the browser's own view of them.
//!
//! # Responsibilities
//! - Queue each proxied request until the browser reports the same load
//! - Queue browser-reported loads the proxy has not seen yet
//! - Hand the browser's request id, resource type and document url to the exchange
//!
//! # Data Flow
//! ```text
//! proxy:   on_mitm_requested_resource(ctx) → BrowserRequestWait
//! browser: on_browser_requested_resource(load) ─┐
//!                                               ├→ matching entry resolved → waiter gets details
//! browser: on_browser_request_failed(load) ─────┘
//! session close → cancel_pending() → waiters get a cancellation error
//! ```
//!
//! # Design Decisions
//! - Entries match on url + method, then Fetch metadata, then referer
//! - A resolved entry older than five seconds never absorbs a new browser load

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use tokio::sync::watch;

use crate::error::{ProxyError, Result};
use crate::http::ResourceType;
use crate::sync::lock;

const STALE_MATCH: Duration = Duration::from_secs(5);
const UNRESOLVED_WARNING: Duration = Duration::from_secs(5);

/// A resource load as the browser reports it.
#[derive(Debug, Clone)]
pub struct BrowserResourceLoad {
    pub browser_request_id: String,
    pub url: String,
    pub method: String,
    pub headers: HeaderMap,
    pub resource_type: Option<ResourceType>,
    pub document_url: Option<String>,
    pub has_user_gesture: bool,
    pub is_http2_push: bool,
    pub request_time: SystemTime,
}

/// What an exchange learns once the browser confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserRequestDetails {
    pub browser_request_id: String,
    pub resource_type: Option<ResourceType>,
    pub document_url: Option<String>,
    pub has_user_gesture: bool,
}

#[derive(Debug, Clone)]
enum Status {
    Pending,
    Resolved(BrowserRequestDetails),
    Canceled,
}

/// An exchange's handle on its pending browser confirmation.
#[derive(Debug)]
pub struct BrowserRequestWait {
    rx: watch::Receiver<Status>,
    has_user_activity: bool,
}

impl BrowserRequestWait {
    /// Whether the request carried `Sec-Fetch-User` or a user gesture.
    pub fn has_user_activity(&self) -> bool {
        self.has_user_activity
    }

    pub async fn resolved(&mut self) -> Result<BrowserRequestDetails> {
        let status = self
            .rx
            .wait_for(|status| !matches!(status, Status::Pending))
            .await
            .map_err(|_| ProxyError::canceled("browser request matcher closed"))?;
        match &*status {
            Status::Resolved(details) => Ok(details.clone()),
            _ => Err(ProxyError::canceled("session closing")),
        }
    }
}

/// The proxy side of a match.
#[derive(Debug, Clone)]
pub struct MitmResource<'a> {
    pub id: u64,
    pub url: &'a str,
    pub method: &'a str,
    pub headers: &'a HeaderMap,
    pub has_user_gesture: bool,
    pub is_http2_push: bool,
    pub request_time: SystemTime,
}

struct RequestedResource {
    url: String,
    method: String,
    headers: HeaderMap,
    request_time: SystemTime,
    is_http2_push: bool,
    mitm_request_id: Option<u64>,
    browser_request_id: Option<String>,
    status: watch::Sender<Status>,
}

impl RequestedResource {
    fn is_resolved(&self) -> bool {
        matches!(*self.status.borrow(), Status::Resolved(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MitmFilter {
    Any,
    NoMitmId,
    HasMitmId,
}

struct Query<'a> {
    url: &'a str,
    method: &'a str,
    headers: &'a HeaderMap,
    is_http2_push: bool,
}

#[derive(Default)]
pub struct BrowserRequestMatcher {
    session_id: String,
    requested: Mutex<Vec<RequestedResource>>,
}

impl BrowserRequestMatcher {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.requested).len()
    }

    /// Registers a proxied request and returns the handle its exchange waits on.
    pub fn on_mitm_requested_resource(&self, resource: MitmResource<'_>) -> BrowserRequestWait {
        let query = Query {
            url: resource.url,
            method: resource.method,
            headers: resource.headers,
            is_http2_push: resource.is_http2_push,
        };
        let rx = {
            let mut requested = lock(&self.requested);
            let index = match find_matching(&requested, &query, MitmFilter::NoMitmId) {
                Some(index) => index,
                None => {
                    requested.push(RequestedResource {
                        url: resource.url.to_string(),
                        method: resource.method.to_string(),
                        headers: resource.headers.clone(),
                        request_time: resource.request_time,
                        is_http2_push: resource.is_http2_push,
                        mitm_request_id: None,
                        browser_request_id: None,
                        status: watch::channel(Status::Pending).0,
                    });
                    requested.len() - 1
                }
            };
            let entry = &mut requested[index];
            entry.mitm_request_id = Some(resource.id);
            entry.status.subscribe()
        };

        // Shared workers never show up on the browser side.
        let is_shared_worker = header(resource.headers, "sec-fetch-dest") == Some("sharedworker");
        if !is_shared_worker {
            let mut watch = rx.clone();
            let session_id = self.session_id.clone();
            let url = resource.url.to_string();
            let id = resource.id;
            tokio::spawn(async move {
                let waited = tokio::time::timeout(
                    UNRESOLVED_WARNING,
                    watch.wait_for(|status| !matches!(status, Status::Pending)),
                )
                .await;
                if waited.is_err() {
                    tracing::warn!(%session_id, request_id = id, %url, "Browser request not resolved");
                }
            });
        }

        BrowserRequestWait {
            rx,
            has_user_activity: resource.headers.contains_key("sec-fetch-user") || resource.has_user_gesture,
        }
    }

    /// Records a load the browser started, resolving the matching proxied request.
    pub fn on_browser_requested_resource(&self, load: &BrowserResourceLoad) {
        let query = Query {
            url: &load.url,
            method: &load.method,
            headers: &load.headers,
            is_http2_push: load.is_http2_push,
        };
        let mut requested = lock(&self.requested);
        let mut index = find_matching(&requested, &query, MitmFilter::Any);
        if let Some(i) = index {
            let entry = &requested[i];
            if entry.is_resolved() && entry.browser_request_id.is_some() {
                let gap = match load.request_time.duration_since(entry.request_time) {
                    Ok(gap) => gap,
                    Err(earlier) => earlier.duration(),
                };
                if gap > STALE_MATCH {
                    index = None;
                }
            }
        }
        let index = match index {
            Some(index) => index,
            None => {
                requested.push(RequestedResource {
                    url: load.url.clone(),
                    method: load.method.clone(),
                    headers: load.headers.clone(),
                    request_time: load.request_time,
                    is_http2_push: load.is_http2_push,
                    mitm_request_id: None,
                    browser_request_id: None,
                    status: watch::channel(Status::Pending).0,
                });
                requested.len() - 1
            }
        };
        resolve(&mut requested[index], load);
    }

    /// Records a load the browser gave up on. Returns the proxied request id it matched.
    pub fn on_browser_request_failed(&self, load: &BrowserResourceLoad) -> Option<u64> {
        let query = Query {
            url: &load.url,
            method: &load.method,
            headers: &load.headers,
            is_http2_push: load.is_http2_push,
        };
        let mut requested = lock(&self.requested);
        let index = requested
            .iter()
            .position(|entry| entry.browser_request_id.as_deref() == Some(load.browser_request_id.as_str()))
            .or_else(|| find_matching(&requested, &query, MitmFilter::HasMitmId));
        let Some(index) = index else {
            tracing::warn!(
                session_id = %self.session_id,
                browser_request_id = %load.browser_request_id,
                url = %load.url,
                "Failed browser load matched no proxied request"
            );
            return None;
        };
        resolve(&mut requested[index], load);
        let id = requested[index].mitm_request_id;
        if id.is_some() {
            requested.remove(index);
        }
        id
    }

    /// Fails every waiter. Used when the session closes.
    pub fn cancel_pending(&self) {
        for entry in lock(&self.requested).drain(..) {
            entry.status.send_if_modified(|status| {
                if matches!(status, Status::Pending) {
                    *status = Status::Canceled;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Forgets a proxied request once its response is out.
    pub fn clear_request(&self, mitm_request_id: u64) {
        let mut requested = lock(&self.requested);
        if let Some(index) = requested
            .iter()
            .position(|entry| entry.mitm_request_id == Some(mitm_request_id))
        {
            requested.remove(index);
        }
    }
}

fn resolve(entry: &mut RequestedResource, load: &BrowserResourceLoad) {
    entry.browser_request_id = Some(load.browser_request_id.clone());
    entry.status.send_replace(Status::Resolved(BrowserRequestDetails {
        browser_request_id: load.browser_request_id.clone(),
        resource_type: load.resource_type,
        document_url: load.document_url.clone(),
        has_user_gesture: load.has_user_gesture,
    }));
}

fn find_matching(requested: &[RequestedResource], query: &Query<'_>, filter: MitmFilter) -> Option<usize> {
    let mut matches: Vec<usize> = requested
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.url == query.url && entry.method == query.method)
        .filter(|(_, entry)| match filter {
            MitmFilter::Any => true,
            MitmFilter::NoMitmId => entry.mitm_request_id.is_none(),
            MitmFilter::HasMitmId => entry.mitm_request_id.is_some(),
        })
        .map(|(index, _)| index)
        .collect();

    // Pushed streams carry no browser-chosen headers to compare.
    if let Some(&push) = matches.iter().find(|&&i| requested[i].is_http2_push) {
        return Some(push);
    }
    if query.is_http2_push {
        return matches.first().copied();
    }

    if query.method == "OPTIONS" {
        let origin = header(query.headers, "origin");
        return matches
            .into_iter()
            .find(|&i| header(&requested[i].headers, "origin") == origin);
    }

    for name in ["sec-fetch-dest", "sec-fetch-site"] {
        if let Some(value) = header(query.headers, name) {
            matches.retain(|&i| header(&requested[i].headers, name) == Some(value));
        }
    }
    if matches.len() == 1 {
        return Some(matches[0]);
    }
    let referer = header(query.headers, "referer");
    matches
        .into_iter()
        .find(|&i| header(&requested[i].headers, "referer") == referer)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
