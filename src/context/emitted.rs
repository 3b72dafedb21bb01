//! Resource descriptions handed to session event subscribers.

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::{Serialize, Serializer};

use crate::http::ResourceType;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedResponse {
    pub url: String,
    /// Status as the server sent it, before cache substitution.
    pub status_code: u16,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub trailers: Option<Vec<(String, String)>>,
    pub timestamp: Option<u64>,
    pub remote_address: Option<String>,
    pub body_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedResource {
    pub id: u64,
    pub browser_request_id: Option<String>,
    pub url: String,
    pub request: EmittedRequest,
    pub response: Option<EmittedResponse>,
    #[serde(serialize_with = "as_base64")]
    pub post_data: Option<Bytes>,
    pub document_url: Option<String>,
    pub previous_url: Option<String>,
    pub first_redirecting_url: Option<String>,
    pub redirected_to_url: Option<String>,
    pub was_cached: bool,
    pub was_intercepted: bool,
    pub resource_type: Option<ResourceType>,
    #[serde(serialize_with = "as_base64")]
    pub body: Option<Bytes>,
    pub local_address: Option<String>,
    pub dns_resolved_ip: Option<String>,
    pub original_headers: Vec<(String, String)>,
    pub response_original_headers: Vec<(String, String)>,
    pub socket_id: Option<u64>,
    pub protocol: &'static str,
    pub server_alpn: Option<String>,
    pub execution_millis: u128,
    pub is_http2_push: bool,
}

fn as_base64<S: Serializer>(bytes: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_str(&general_purpose::STANDARD.encode(bytes)),
        None => serializer.serialize_none(),
    }
}
