//! Per-request view of the response cache.
//!
//! # Data Flow
//! ```text
//! on_request          GET with no conditional header + cached entry
//!                       → add If-None-Match, remember the proposed entry
//! on_response_headers 304 for a proposed entry
//!                       → status 200, cached length/type/encoding, serve cached bytes
//! on_response_data    forward live bytes (or swallow them when serving cached)
//! on_response_end     complete 200 with an ETag, nothing proposed → store
//! ```

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::Method;

use super::store::{CachedResponse, ResponseCache};
use crate::observability::metrics;

pub struct CacheHandler {
    cache: Option<ResponseCache>,
    url: String,
    is_get: bool,
    proposed: Option<CachedResponse>,
    serve_cached: bool,
    buffering: bool,
    buffer: BytesMut,
}

impl CacheHandler {
    /// `cache` is `None` when caching is disabled.
    pub fn new(cache: Option<ResponseCache>, url: &str, method: &Method) -> Self {
        Self {
            cache,
            url: url.to_string(),
            is_get: method == Method::GET,
            proposed: None,
            serve_cached: false,
            buffering: false,
            buffer: BytesMut::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// True once a 304 was turned into a replay of the cached body.
    pub fn should_serve_cached_data(&self) -> bool {
        self.serve_cached
    }

    pub fn cached_data(&self) -> Option<Bytes> {
        match (&self.proposed, self.serve_cached) {
            (Some(entry), true) => Some(entry.body.clone()),
            _ => None,
        }
    }

    pub fn on_request(&mut self, headers: &mut HeaderMap) {
        let Some(cache) = &self.cache else { return };
        if !self.is_get
            || headers.contains_key(header::IF_NONE_MATCH)
            || headers.contains_key(header::IF_MODIFIED_SINCE)
        {
            return;
        }
        let Some(entry) = cache.get(&self.url) else { return };
        if let Ok(etag) = HeaderValue::from_str(&entry.etag) {
            headers.insert(header::IF_NONE_MATCH, etag);
            self.proposed = Some(entry);
        }
    }

    /// Inspects the live response head, rewriting it when the cached copy will be served.
    pub fn on_response_headers(&mut self, status: &mut u16, headers: &mut HeaderMap) {
        if self.cache.is_none() {
            return;
        }
        if *status == 304 && self.proposed.is_some() {
            *status = 200;
            self.serve_cached = true;
            self.apply_cached_headers(headers);
            metrics::record_cache_hit();
            return;
        }
        self.buffering = self.is_get && *status == 200 && self.proposed.is_none();
    }

    /// Check-and-substitute for an HTTP/2 pushed stream.
    ///
    /// Pushes never carry our `If-None-Match`, so a push whose ETag matches the cached
    /// entry (or that answers 304) is replayed from the cache.
    pub fn on_http2_push_stream(&mut self, status: &mut u16, headers: &mut HeaderMap) {
        let Some(cache) = &self.cache else { return };
        if !self.is_get {
            return;
        }
        if let Some(entry) = cache.get(&self.url) {
            let etag = headers.get(header::ETAG).and_then(|v| v.to_str().ok());
            if *status == 304 || etag == Some(entry.etag.as_str()) {
                self.proposed = Some(entry);
                *status = 200;
                self.serve_cached = true;
                self.apply_cached_headers(headers);
                metrics::record_cache_hit();
                return;
            }
        }
        self.buffering = *status == 200;
    }

    fn apply_cached_headers(&self, headers: &mut HeaderMap) {
        let Some(entry) = &self.proposed else { return };
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.body.len()));
        headers.remove(header::CONTENT_ENCODING);
        if let Some(encoding) = entry
            .content_encoding
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(header::CONTENT_ENCODING, encoding);
        }
        if let Some(content_type) = entry
            .content_type
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
    }

    /// Returns the bytes to forward to the client, or `None` when they are suppressed.
    pub fn on_response_data(&mut self, chunk: Bytes) -> Option<Bytes> {
        if self.serve_cached {
            return None;
        }
        if self.buffering {
            self.buffer.extend_from_slice(&chunk);
        }
        Some(chunk)
    }

    /// Called after the body completed without error.
    pub fn on_response_end(&mut self, headers: &HeaderMap, was_intercepted: bool) {
        let Some(cache) = &self.cache else { return };
        if !self.buffering || self.serve_cached || was_intercepted {
            return;
        }
        let Some(etag) = headers.get(header::ETAG).and_then(|v| v.to_str().ok()) else {
            return;
        };
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        cache.put(
            &self.url,
            CachedResponse {
                etag: etag.to_string(),
                body: std::mem::take(&mut self.buffer).freeze(),
                content_type: text(header::CONTENT_TYPE),
                content_encoding: text(header::CONTENT_ENCODING),
            },
        );
        self.buffering = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://a.com/app.js";

    fn response_headers(etag: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::ETAG, HeaderValue::from_static(etag));
        h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/javascript"));
        h.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        h
    }

    fn complete_exchange(cache: &ResponseCache, body: &'static [u8]) {
        let mut handler = CacheHandler::new(Some(cache.clone()), URL, &Method::GET);
        let mut request = HeaderMap::new();
        handler.on_request(&mut request);
        let mut status = 200;
        let mut headers = response_headers("\"v1\"");
        handler.on_response_headers(&mut status, &mut headers);
        assert_eq!(handler.on_response_data(Bytes::from_static(body)).unwrap(), body);
        handler.on_response_end(&headers, false);
    }

    #[test]
    fn stores_then_replays_on_304() {
        let cache = ResponseCache::new();
        complete_exchange(&cache, b"console.log(1)");

        let mut handler = CacheHandler::new(Some(cache.clone()), URL, &Method::GET);
        let mut request = HeaderMap::new();
        handler.on_request(&mut request);
        assert_eq!(request[header::IF_NONE_MATCH], "\"v1\"");

        let mut status = 304;
        let mut headers = HeaderMap::new();
        handler.on_response_headers(&mut status, &mut headers);
        assert_eq!(status, 200);
        assert!(handler.should_serve_cached_data());
        assert_eq!(headers[header::CONTENT_LENGTH], "14");
        assert_eq!(headers[header::CONTENT_TYPE], "application/javascript");
        assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
        assert!(handler.on_response_data(Bytes::from_static(b"ignored")).is_none());
        assert_eq!(&handler.cached_data().unwrap()[..], b"console.log(1)");
    }

    #[test]
    fn browser_conditional_headers_are_left_alone() {
        let cache = ResponseCache::new();
        complete_exchange(&cache, b"x");
        let mut handler = CacheHandler::new(Some(cache), URL, &Method::GET);
        let mut request = HeaderMap::new();
        request.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"browser\""));
        handler.on_request(&mut request);
        assert_eq!(request[header::IF_NONE_MATCH], "\"browser\"");
        let mut status = 304;
        handler.on_response_headers(&mut status, &mut HeaderMap::new());
        assert_eq!(status, 304);
    }

    #[test]
    fn non_get_and_disabled_do_nothing() {
        let cache = ResponseCache::new();
        let mut post = CacheHandler::new(Some(cache.clone()), URL, &Method::POST);
        let mut status = 200;
        let headers = response_headers("\"p\"");
        post.on_response_headers(&mut status, &mut headers.clone());
        post.on_response_data(Bytes::from_static(b"data"));
        post.on_response_end(&headers, false);
        assert!(cache.is_empty());

        let mut disabled = CacheHandler::new(None, URL, &Method::GET);
        assert!(!disabled.is_enabled());
        disabled.on_response_headers(&mut status, &mut headers.clone());
        disabled.on_response_end(&headers, false);
        assert!(cache.is_empty());
    }

    #[test]
    fn intercepted_responses_are_not_stored() {
        let cache = ResponseCache::new();
        let mut handler = CacheHandler::new(Some(cache.clone()), URL, &Method::GET);
        let mut status = 200;
        let mut headers = response_headers("\"i\"");
        handler.on_response_headers(&mut status, &mut headers);
        handler.on_response_data(Bytes::from_static(b"blocked"));
        handler.on_response_end(&headers, true);
        assert!(cache.is_empty());
    }

    #[test]
    fn push_with_matching_etag_is_served_from_cache() {
        let cache = ResponseCache::new();
        complete_exchange(&cache, b"pushed");
        let mut handler = CacheHandler::new(Some(cache), URL, &Method::GET);
        let mut status = 200;
        let mut headers = response_headers("\"v1\"");
        handler.on_http2_push_stream(&mut status, &mut headers);
        assert!(handler.should_serve_cached_data());
        assert_eq!(&handler.cached_data().unwrap()[..], b"pushed");
    }
}
