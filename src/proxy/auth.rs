//! Session attribution for incoming connections.
//!
//! # Responsibilities
//! - Read the session id from `Proxy-Authorization: Basic base64(user:sessionId)`
//! - Remember which loopback ports belong to which session, so requests on a
//!   tunneled socket (which carry no credentials) still find their session
//! - Build the `407` and `504` answers for unattributed requests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use http::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderMap, Response, StatusCode};

use crate::http::body::{self, ProxyBody};
use crate::session::RequestSession;

/// Result of attributing a request to a session.
#[derive(Debug)]
pub enum SessionLookup {
    Found(Arc<RequestSession>),
    /// No credentials and no known tunnel port.
    Unauthenticated,
    /// A session id was supplied but nothing is registered under it.
    NotRegistered(String),
}

/// Reads the session id from the password half of a Basic proxy credential.
pub fn read_session_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.split(' ').nth(1)?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    credentials
        .split(':')
        .nth(1)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub fn proxy_auth_required() -> Response<ProxyBody> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    response
        .headers_mut()
        .insert(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"session-mitm\""));
    response
}

pub fn proxy_error() -> Response<ProxyBody> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
    response
}

/// Sessions known to one proxy, plus the tunnel ports opened on their behalf.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<RequestSession>>,
    session_by_port: DashMap<u16, String>,
    host_by_port: DashMap<u16, String>,
    ports_by_session: DashMap<String, HashSet<u16>>,
    isolated: RwLock<Option<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. A default session claims every connection from then on.
    pub fn register(&self, session: Arc<RequestSession>, is_default: bool) {
        let id = session.id().to_string();
        if is_default {
            *self.isolated.write().unwrap_or_else(|p| p.into_inner()) = Some(id.clone());
        }
        self.sessions.insert(id, session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<RequestSession>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn sessions(&self) -> Vec<Arc<RequestSession>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Records that connections arriving from `port` belong to `session_id`.
    pub fn register_port(&self, port: u16, session_id: &str) {
        self.session_by_port.insert(port, session_id.to_string());
        self.ports_by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(port);
    }

    /// Records the hostname a tunnel from `port` was opened for.
    pub fn register_tunnel_host(&self, port: u16, host: &str) {
        self.host_by_port.insert(port, host.to_string());
    }

    pub fn tunnel_host(&self, port: u16) -> Option<String> {
        self.host_by_port.get(&port).map(|entry| entry.value().clone())
    }

    pub fn unregister_port(&self, port: u16) {
        self.host_by_port.remove(&port);
        if let Some((_, session_id)) = self.session_by_port.remove(&port) {
            if let Some(mut ports) = self.ports_by_session.get_mut(&session_id) {
                ports.remove(&port);
            }
        }
    }

    /// Forgets a session and every port mapped to it.
    pub fn remove(&self, session_id: &str) {
        if let Some((_, ports)) = self.ports_by_session.remove(session_id) {
            for port in ports {
                self.session_by_port.remove(&port);
                self.host_by_port.remove(&port);
            }
        }
        self.sessions.remove(session_id);
    }

    /// The session id a request belongs to, if any.
    pub fn session_id_for(&self, headers: &HeaderMap, remote_port: u16) -> Option<String> {
        if let Some(isolated) = self.isolated.read().unwrap_or_else(|p| p.into_inner()).clone() {
            return Some(isolated);
        }
        if headers.contains_key(PROXY_AUTHORIZATION) {
            return read_session_id(headers);
        }
        self.session_by_port.get(&remote_port).map(|entry| entry.value().clone())
    }

    pub fn lookup(&self, headers: &HeaderMap, remote_port: u16) -> SessionLookup {
        match self.session_id_for(headers, remote_port) {
            None => SessionLookup::Unauthenticated,
            Some(id) => match self.get(&id) {
                Some(session) => SessionLookup::Found(session),
                None => SessionLookup::NotRegistered(id),
            },
        }
    }

    /// Port-to-session pairs, for diagnostics.
    pub fn port_map(&self) -> HashMap<u16, String> {
        self.session_by_port
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}
