//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool size > 0)
//! - Check addresses and upstream proxy urls parse
//! - Detect duplicate or conflicting sessions
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (field, value) in [
        ("listener.bind_address", &config.listener.bind_address),
        ("listener.loopback_address", &config.listener.loopback_address),
    ] {
        if value.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(field, format!("'{}' is not a socket address", value)));
        }
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_ms", timeouts.connect_ms),
        ("timeouts.dns_query_ms", timeouts.dns_query_ms),
        ("timeouts.pool_wait_ms", timeouts.pool_wait_ms),
        ("timeouts.reused_socket_probe_ms", timeouts.reused_socket_probe_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.pool.max_connections_per_origin == 0 {
        errors.push(ValidationError::new(
            "pool.max_connections_per_origin",
            "must be greater than 0",
        ));
    }

    if let Some(dot) = &config.dns.dns_over_tls {
        if dot.host.is_empty() {
            errors.push(ValidationError::new("dns.dns_over_tls.host", "must not be empty"));
        }
        if dot.servername.is_empty() {
            errors.push(ValidationError::new("dns.dns_over_tls.servername", "must not be empty"));
        }
    }

    let mut seen = HashSet::new();
    let mut isolated = 0;
    for (i, session) in config.sessions.iter().enumerate() {
        if session.id.is_empty() || session.id.contains(':') {
            errors.push(ValidationError::new(
                format!("sessions[{}].id", i),
                "must be non-empty and contain no ':'",
            ));
        }
        if !seen.insert(session.id.as_str()) {
            errors.push(ValidationError::new(
                format!("sessions[{}].id", i),
                format!("duplicate session id '{}'", session.id),
            ));
        }
        if let Some(proxy_url) = &session.upstream_proxy_url {
            match url::Url::parse(proxy_url) {
                Ok(parsed) if parsed.scheme() == "http" && parsed.host_str().is_some() => {}
                _ => errors.push(ValidationError::new(
                    format!("sessions[{}].upstream_proxy_url", i),
                    "must be an http:// url with a host",
                )),
            }
        }
        if session.isolated {
            isolated += 1;
        }
    }
    if isolated > 1 {
        errors.push(ValidationError::new("sessions", "only one session may be isolated"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "is not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
