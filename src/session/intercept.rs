//! Interception rules.
//!
//! # Responsibilities
//! - Match requests by resource type or url pattern
//! - Let a rule's handler answer a request instead of the network
//!
//! # Design Decisions
//! - A rule matches if any of its types OR any of its url patterns match
//! - String patterns are unanchored; `*` is the only wildcard
//! - Rules are evaluated in order; the first handler that answers wins

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use regex::Regex;
use url::Url;

use crate::http::ResourceType;

/// A url condition of an interception rule.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    regex: Regex,
}

impl UrlPattern {
    /// Compiles a wildcard pattern such as `*.css` or `https://ads.example.com/*`.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let source = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Ok(Self {
            regex: Regex::new(&source)?,
        })
    }

    pub fn from_regex(regex: Regex) -> Self {
        Self { regex }
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}

/// What a handler sees of the request it may answer.
#[derive(Debug, Clone, Copy)]
pub struct InterceptRequest<'a> {
    pub url: &'a Url,
    pub resource_type: Option<ResourceType>,
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
}

/// A response written to the client in place of the real one.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InterceptedResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Answer for a blocked request nobody handled.
    pub fn blocked() -> Self {
        Self::new(StatusCode::NOT_FOUND, Bytes::new())
            .with_header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html"))
    }
}

#[async_trait]
pub trait InterceptHandler: Send + Sync {
    /// Returns a response to send instead of fetching, or `None` to let the request through.
    async fn handle(&self, request: InterceptRequest<'_>) -> Option<InterceptedResponse>;
}

#[derive(Clone, Default)]
pub struct InterceptRule {
    types: Vec<ResourceType>,
    urls: Vec<UrlPattern>,
    handler: Option<Arc<dyn InterceptHandler>>,
}

impl std::fmt::Debug for InterceptRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptRule")
            .field("types", &self.types)
            .field("urls", &self.urls)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl InterceptRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = ResourceType>) -> Self {
        self.types.extend(types);
        self
    }

    pub fn with_url(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.urls.push(UrlPattern::new(pattern)?);
        Ok(self)
    }

    pub fn with_url_regex(mut self, regex: Regex) -> Self {
        self.urls.push(UrlPattern::from_regex(regex));
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn InterceptHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn handler(&self) -> Option<&Arc<dyn InterceptHandler>> {
        self.handler.as_ref()
    }

    pub fn matches_type(&self, resource_type: Option<ResourceType>) -> bool {
        resource_type.is_some_and(|kind| self.types.contains(&kind))
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.urls.iter().any(|pattern| pattern.matches(url))
    }

    pub fn matches(&self, url: &str, resource_type: Option<ResourceType>) -> bool {
        self.matches_type(resource_type) || self.matches_url(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_patterns() {
        let css = UrlPattern::new("*.css").unwrap();
        assert!(css.matches("https://example.com/site.css"));
        assert!(!css.matches("https://example.com/site.js"));

        let host = UrlPattern::new("https://ads.example.com/*").unwrap();
        assert!(host.matches("https://ads.example.com/banner?x=1"));
        assert!(!host.matches("https://example.com/ads.example.com"));
    }

    #[test]
    fn special_characters_are_literal() {
        let pattern = UrlPattern::new("/api/v1?(x)").unwrap();
        assert!(pattern.matches("https://a.com/api/v1?(x)=2"));
        assert!(!pattern.matches("https://a.com/api/v"));
    }

    #[test]
    fn rules_match_by_type_or_url() {
        let rule = InterceptRule::new()
            .with_types([ResourceType::Image])
            .with_url("*.woff2")
            .unwrap();
        assert!(rule.matches("https://a.com/x.png", Some(ResourceType::Image)));
        assert!(rule.matches("https://a.com/font.woff2", None));
        assert!(!rule.matches("https://a.com/x.png", None));
        assert!(!rule.matches("https://a.com/app.js", Some(ResourceType::Script)));
    }
}
