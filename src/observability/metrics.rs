//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, errors, sockets, cache, DNS)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `mitm_requests_total` (counter): completed exchanges by protocol, status
//! - `mitm_request_duration_seconds` (histogram): client request to response end
//! - `mitm_http_errors_total` (counter): failed exchanges by error kind
//! - `mitm_sockets_opened_total` (counter): server-facing sockets by alpn
//! - `mitm_cache_hits_total` (counter): responses served from the ETag cache
//! - `mitm_dns_lookups_total` (counter): lookups by source (cache, tls, system)
//! - `mitm_active_tunnels` (gauge): open CONNECT tunnels
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Recording is a no-op until a recorder is installed

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(error) => tracing::error!(%error, "Failed to install metrics recorder"),
    }
}

pub fn record_request(protocol: &'static str, status: u16, start: Instant) {
    metrics::counter!(
        "mitm_requests_total",
        "protocol" => protocol,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("mitm_request_duration_seconds", "protocol" => protocol)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_http_error(kind: &'static str) {
    metrics::counter!("mitm_http_errors_total", "kind" => kind).increment(1);
}

pub fn record_socket_opened(alpn: &str) {
    metrics::counter!("mitm_sockets_opened_total", "alpn" => alpn.to_string()).increment(1);
}

pub fn record_cache_hit() {
    metrics::counter!("mitm_cache_hits_total").increment(1);
}

pub fn record_dns_lookup(source: &'static str) {
    metrics::counter!("mitm_dns_lookups_total", "source" => source).increment(1);
}

pub fn record_active_tunnels(count: u64) {
    metrics::gauge!("mitm_active_tunnels").set(count as f64);
}
