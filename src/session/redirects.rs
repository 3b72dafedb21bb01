//! Redirect chains observed within a session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::sync::lock;

/// Redirects older than this no longer explain a new request.
pub const REDIRECT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RedirectRecord {
    url: String,
    /// Earlier urls of the chain, most recent first.
    chain: Vec<String>,
    response_time: SystemTime,
}

/// Where a request came from, if it followed a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSource {
    pub previous_url: String,
    pub first_redirecting_url: String,
}

#[derive(Debug, Default)]
pub struct RedirectTracker {
    by_redirected_url: Mutex<HashMap<String, Vec<RedirectRecord>>>,
}

impl RedirectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The redirect that led to `url`, if one happened shortly before `request_time`.
    pub fn lookup_source(&self, url: &str, request_time: SystemTime) -> Option<RedirectSource> {
        let records = lock(&self.by_redirected_url);
        let record = records
            .get(url)?
            .iter()
            .find(|record| within_window(request_time, record.response_time))?;
        let first = record.chain.last().unwrap_or(&record.url).clone();
        Some(RedirectSource {
            previous_url: record.url.clone(),
            first_redirecting_url: first,
        })
    }

    /// Records that `url`, requested at `request_time`, redirected to `redirected_to`.
    pub fn track(&self, url: &str, redirected_to: &str, request_time: SystemTime, response_time: SystemTime) {
        let mut records = lock(&self.by_redirected_url);
        records.retain(|_, list| {
            list.retain(|record| within_window(response_time, record.response_time));
            !list.is_empty()
        });

        let chain = records
            .get(url)
            .and_then(|list| {
                list.iter()
                    .find(|record| within_window(request_time, record.response_time))
            })
            .map(|source| {
                let mut chain = vec![source.url.clone()];
                chain.extend(source.chain.iter().cloned());
                chain
            })
            .unwrap_or_default();

        records
            .entry(redirected_to.to_string())
            .or_default()
            .push(RedirectRecord {
                url: url.to_string(),
                chain,
                response_time,
            });
    }
}

fn within_window(now: SystemTime, then: SystemTime) -> bool {
    now.duration_since(then)
        .map(|elapsed| elapsed < REDIRECT_WINDOW)
        .unwrap_or(true)
}
