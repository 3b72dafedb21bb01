//! In-memory ETag response store.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// A cached response body and the headers needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub etag: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// A thread-safe response store keyed by absolute url.
///
/// Writes overwrite; concurrent writers for the same url race and the last one wins.
/// Entries live as long as the store.
#[derive(Clone, Default, Debug)]
pub struct ResponseCache {
    inner: Arc<DashMap<String, CachedResponse>>,
}

impl ResponseCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for a url.
    pub fn get(&self, url: &str) -> Option<CachedResponse> {
        self.inner.get(url).map(|entry| entry.value().clone())
    }

    /// Store (or replace) the entry for a url.
    pub fn put(&self, url: &str, response: CachedResponse) {
        tracing::trace!(url, etag = %response.etag, bytes = response.body.len(), "Caching response");
        self.inner.insert(url.to_string(), response);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
