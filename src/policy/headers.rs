//! Header sanitation for both directions.
//!
//! All matching is case-insensitive and every function here is idempotent:
//! applying it twice equals applying it once.

use std::collections::BTreeMap;

use axum::http::HeaderMap;

/// Request headers the server plane never forwards.
const HOP_BY_HOP_REQUEST: &[&str] = &["host", "connection", "content-length"];

/// Request headers the browser plane strips in addition; its own HTTP
/// stack repopulates these and rejects attempts to set them.
const BROWSER_MANAGED: &[&str] = &[
    "origin",
    "referer",
    "user-agent",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-dest",
];

/// Response headers that no longer describe the re-chunked body replayed
/// to the local client.
const RESPONSE_STRIPPED: &[&str] = &[
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "connection",
];

fn listed(names: &[&str], name: &str) -> bool {
    names.iter().any(|n| name.eq_ignore_ascii_case(n))
}

/// Collapse an incoming header map to the set forwarded to the agent.
/// Non-UTF-8 values are dropped; the upstream would not accept them.
pub fn sanitize_request_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if listed(HOP_BY_HOP_REQUEST, name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

/// Second-stage strip applied by the agent before the upstream call.
pub fn sanitize_agent_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !listed(HOP_BY_HOP_REQUEST, name) && !listed(BROWSER_MANAGED, name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Drop response headers invalidated by re-chunking. The absence of
/// `content-length` in the result is intentional.
pub fn filter_response_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !listed(RESPONSE_STRIPPED, name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// A filtered 200 without a content type is almost always an event stream
/// that lost its type along the way; give the client one to parse.
pub fn salvage_content_type(headers: &mut BTreeMap<String, String>, status: u16) {
    if status != 200 {
        return;
    }
    let present = headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"));
    if !present {
        headers.insert("content-type".to_string(), "text/event-stream".to_string());
    }
}
