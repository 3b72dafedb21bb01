//! Header translation between the client and server legs.
//!
//! # Responsibilities
//! - Strip proxy-only headers before forwarding
//! - Convert HTTP/1.1 header sets to HTTP/2 form (and back)
//! - Sanitize server response headers
//! - Detect redirects and connection-close semantics

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use url::Url;

/// Statuses that carry a `Location` to follow.
pub const REDIRECT_CODES: [u16; 7] = [300, 301, 302, 303, 305, 307, 308];

/// Connection-specific headers that are illegal in HTTP/2 messages.
const STRIP_FOR_HTTP2: [&str; 9] = [
    "connection",
    "upgrade",
    "http2-settings",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "host",
    "via",
    "forwarded",
];

/// Headers permitted to carry a single value in HTTP/2.
const SINGLE_VALUE_HTTP2: [&str; 37] = [
    "access-control-allow-credentials",
    "access-control-max-age",
    "access-control-request-method",
    "age",
    "authorization",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-md5",
    "content-range",
    "content-type",
    "date",
    "dnt",
    "etag",
    "expires",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "last-modified",
    "location",
    "max-forwards",
    "proxy-authorization",
    "range",
    "referer",
    "retry-after",
    "tk",
    "upgrade-insecure-requests",
    "user-agent",
    "x-content-type-options",
    ":status",
    ":authority",
    ":path",
];

pub fn is_redirect(status: u16) -> bool {
    REDIRECT_CODES.contains(&status)
}

/// Resolves the redirect target of a response, relative to the request url.
pub fn redirect_location(status: u16, headers: &HeaderMap, base: &Url) -> Option<Url> {
    if !is_redirect(status) {
        return None;
    }
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    base.join(location).ok()
}

/// True if `value` contains a byte outside `\t`, `0x20..=0x7e` and `0x80..=0xff`.
pub fn has_invalid_header_char(value: &[u8]) -> bool {
    value
        .iter()
        .any(|&b| !(b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80))
}

fn is_single_value(name: &HeaderName) -> bool {
    SINGLE_VALUE_HTTP2.contains(&name.as_str())
}

fn is_proxy_header(name: &HeaderName) -> bool {
    name.as_str().starts_with("proxy-")
}

/// Removes every `proxy-*` header.
pub fn clean_proxy_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers.keys().filter(|n| is_proxy_header(n)).cloned().collect();
    for name in names {
        headers.remove(&name);
    }
}

/// Prepares headers for an HTTP/1.1 server request: drops `proxy-*` and injects `Host`.
pub fn prepare_http1_request_headers(headers: &mut HeaderMap, url: &Url) {
    clean_proxy_headers(headers);
    if !headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&host_with_port(url)) {
            headers.insert(header::HOST, value);
        }
    }
}

/// Builds the header block for an HTTP/2 server request.
///
/// The pseudo headers come from the request uri, so only regular headers remain here:
/// connection-specific headers and `proxy-*` are removed and single-value headers
/// are coalesced to their first value.
pub fn prepare_http2_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for name in headers.keys() {
        let lower = name.as_str();
        if STRIP_FOR_HTTP2.contains(&lower) || is_proxy_header(name) {
            continue;
        }
        if name == header::TE {
            // only "trailers" is legal for te in HTTP/2
            if headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("trailers"))
            {
                out.insert(header::TE, HeaderValue::from_static("trailers"));
            }
            continue;
        }
        if is_single_value(name) {
            if let Some(first) = headers.get(name) {
                out.insert(name.clone(), first.clone());
            }
            continue;
        }
        for value in headers.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Same rules as a request converted to HTTP/2, applied to a server push request.
pub fn clean_push_headers(headers: &HeaderMap) -> HeaderMap {
    prepare_http2_request_headers(headers)
}

/// Strips headers an HTTP/2 client connection would reject from a response.
pub fn prepare_http2_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = prepare_http2_request_headers(headers);
    out.remove(header::TE);
    out
}

/// Sanitizes a server response header block before it is forwarded to the client.
pub fn clean_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for name in headers.keys() {
        let lower = name.as_str();
        if lower == "public-key-pins" || lower == ":status" || lower == "http2-settings" {
            continue;
        }
        let mut values = headers.get_all(name).iter();
        let is_list = headers.get_all(name).iter().count() > 1;
        if is_list && is_single_value(name) {
            if let Some(first) = values.next() {
                out.insert(name.clone(), first.clone());
            }
            continue;
        }
        for value in values {
            if has_invalid_header_char(value.as_bytes()) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// True if either side asked to close the connection after this exchange.
pub fn is_connection_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

/// True for `Connection: upgrade` + `Upgrade: <proto>` requests.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Default port for a scheme, as used in origin keys.
pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

/// `host:port` key of a url, with the scheme's default port filled in.
pub fn origin_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port().unwrap_or_else(|| default_port(url.scheme()));
    format!("{}:{}", host, port)
}

/// Host header value: the host plus port when it is not the scheme's default.
pub fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Path and query of a url, for origin-form request targets.
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut m = HeaderMap::new();
        for (k, v) in pairs {
            m.append(*k, HeaderValue::from_static(v));
        }
        m
    }

    #[test]
    fn http2_headers_drop_connection_specific() {
        let headers = map(&[
            ("host", "a.com"),
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("proxy-authorization", "Basic x"),
            ("te", "gzip"),
            ("accept", "text/html"),
            ("cookie", "a=1"),
            ("cookie", "b=2"),
            ("user-agent", "one"),
            ("user-agent", "two"),
        ]);
        let out = prepare_http2_request_headers(&headers);
        assert!(!out.contains_key("host"));
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("keep-alive"));
        assert!(!out.contains_key("proxy-authorization"));
        assert!(!out.contains_key("te"));
        assert_eq!(out.get_all("cookie").iter().count(), 2);
        assert_eq!(out.get_all("user-agent").iter().count(), 1);
        assert_eq!(out["user-agent"], "one");
    }

    #[test]
    fn te_trailers_survives() {
        let out = prepare_http2_request_headers(&map(&[("te", "trailers")]));
        assert_eq!(out["te"], "trailers");
    }

    #[test]
    fn http1_headers_get_host() {
        let url = Url::parse("http://example.com:8080/a?b=1").unwrap();
        let mut headers = map(&[("proxy-connection", "keep-alive")]);
        prepare_http1_request_headers(&mut headers, &url);
        assert_eq!(headers["host"], "example.com:8080");
        assert!(!headers.contains_key("proxy-connection"));
        assert_eq!(path_and_query(&url), "/a?b=1");
    }

    #[test]
    fn response_headers_are_sanitized() {
        let mut headers = map(&[
            ("public-key-pins", "pin"),
            ("http2-settings", "AAA"),
            ("content-type", "text/html"),
            ("content-type", "text/plain"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);
        // SAFETY: test-only value with a byte the http crate would reject
        let bad = unsafe { HeaderValue::from_maybe_shared_unchecked(bytes::Bytes::from_static(b"ok\x7fnot")) };
        headers.append("x-bad", bad);
        let out = clean_response_headers(&headers);
        assert!(!out.contains_key("public-key-pins"));
        assert!(!out.contains_key("http2-settings"));
        assert!(!out.contains_key("x-bad"));
        assert_eq!(out.get_all("content-type").iter().count(), 1);
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn invalid_chars() {
        assert!(!has_invalid_header_char(b"abc\tdef \x80\xff"));
        assert!(has_invalid_header_char(b"a\x01"));
        assert!(has_invalid_header_char(b"a\x7f"));
    }

    #[test]
    fn redirects_resolve_relative_locations() {
        let base = Url::parse("https://a.com/x/y").unwrap();
        let headers = map(&[("location", "/z")]);
        assert_eq!(
            redirect_location(302, &headers, &base).unwrap().as_str(),
            "https://a.com/z"
        );
        assert!(redirect_location(200, &headers, &base).is_none());
        assert!(!is_redirect(304));
    }

    #[test]
    fn origin_keys_fill_default_ports() {
        assert_eq!(origin_key(&Url::parse("https://a.com/").unwrap()), "a.com:443");
        assert_eq!(origin_key(&Url::parse("ws://a.com/").unwrap()), "a.com:80");
        assert_eq!(origin_key(&Url::parse("http://a.com:81/").unwrap()), "a.com:81");
    }

    #[test]
    fn connection_semantics() {
        assert!(is_connection_close(&map(&[("connection", "Close")])));
        assert!(!is_connection_close(&map(&[("connection", "keep-alive")])));
        assert!(is_upgrade_request(&map(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket")
        ])));
    }
}
