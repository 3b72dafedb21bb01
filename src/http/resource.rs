//! Resource classification from Fetch metadata headers.

use http::{HeaderMap, Method};
use serde::Serialize;
use url::Url;

/// Browser resource classification used for caching and interception decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Script,
    Fetch,
    Font,
    Image,
    Media,
    Manifest,
    Other,
    #[serde(rename = "CSPViolationReport")]
    CspViolationReport,
    TextTrack,
    Preflight,
    Websocket,
}

impl ResourceType {
    /// Maps a `Sec-Fetch-Dest` value to a resource type.
    pub fn from_fetch_dest(dest: &str) -> Option<Self> {
        let kind = match dest {
            "document" | "nested-document" | "iframe" => ResourceType::Document,
            "style" | "xslt" => ResourceType::Stylesheet,
            "script" => ResourceType::Script,
            "empty" => ResourceType::Fetch,
            "font" => ResourceType::Font,
            "image" => ResourceType::Image,
            "video" | "audio" | "paintworklet" | "audioworklet" => ResourceType::Media,
            "manifest" => ResourceType::Manifest,
            "embed" | "object" | "worker" | "serviceworker" | "sharedworker" => ResourceType::Other,
            "report" => ResourceType::CspViolationReport,
            "track" => ResourceType::TextTrack,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "Document",
            ResourceType::Stylesheet => "Stylesheet",
            ResourceType::Script => "Script",
            ResourceType::Fetch => "Fetch",
            ResourceType::Font => "Font",
            ResourceType::Image => "Image",
            ResourceType::Media => "Media",
            ResourceType::Manifest => "Manifest",
            ResourceType::Other => "Other",
            ResourceType::CspViolationReport => "CSPViolationReport",
            ResourceType::TextTrack => "TextTrack",
            ResourceType::Preflight => "Preflight",
            ResourceType::Websocket => "Websocket",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship between the initiating document and the request target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginType {
    None,
    SameOrigin,
    SameSite,
    CrossSite,
}

impl OriginType {
    pub fn from_fetch_site(site: &str) -> Option<Self> {
        match site {
            "none" => Some(OriginType::None),
            "same-origin" => Some(OriginType::SameOrigin),
            "same-site" => Some(OriginType::SameSite),
            "cross-site" => Some(OriginType::CrossSite),
            _ => None,
        }
    }
}

/// What the request headers say about the resource, before any browser confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub resource_type: Option<ResourceType>,
    pub origin_type: Option<OriginType>,
    pub has_user_gesture: bool,
    pub is_user_navigation: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn classify(method: &Method, url: &Url, headers: &HeaderMap, is_upgrade: bool) -> Classification {
    let fetch_dest = header(headers, "sec-fetch-dest");
    let fetch_mode = header(headers, "sec-fetch-mode");

    let mut resource_type = fetch_dest.and_then(ResourceType::from_fetch_dest);
    if method == Method::OPTIONS {
        resource_type = Some(ResourceType::Preflight);
    }
    if is_upgrade {
        resource_type = Some(ResourceType::Websocket);
    }

    let origin_type = header(headers, "sec-fetch-site")
        .and_then(OriginType::from_fetch_site)
        .or_else(|| {
            header(headers, "origin")
                .or_else(|| header(headers, "referer"))
                .and_then(|source| Url::parse(source).ok())
                .map(|source| origin_type_between(&source, url))
        });

    let has_user_gesture = header(headers, "sec-fetch-user") == Some("?1");
    let is_document_navigation = fetch_mode == Some("navigate") && fetch_dest == Some("document");

    Classification {
        resource_type,
        origin_type,
        has_user_gesture,
        is_user_navigation: fetch_mode.is_some() && is_document_navigation && has_user_gesture,
    }
}

/// Compares two urls the way `Sec-Fetch-Site` would.
pub fn origin_type_between(source: &Url, target: &Url) -> OriginType {
    if source.origin() == target.origin() {
        return OriginType::SameOrigin;
    }
    match (source.host_str(), target.host_str()) {
        (Some(a), Some(b)) if site_of(a) == site_of(b) && source.scheme() == target.scheme() => {
            OriginType::SameSite
        }
        _ => OriginType::CrossSite,
    }
}

// Registrable domain approximated as the last two labels.
fn site_of(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.trim_end_matches('.').rsplitn(3, '.').collect();
    labels.iter().take(2).rev().copied().collect::<Vec<_>>().join(".")
}
