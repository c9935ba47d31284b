//! Request rewriting applied before a spec is handed to the agent.
//!
//! Order matters: path repair first, then query stripping, then the body
//! rewrite. Bodies that do not parse as JSON objects pass through
//! untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

/// Some clients double the models segment when they concatenate base URL
/// and model path.
const DOUBLED_MODELS_SEGMENT: &str = "/models/models/";

/// Authentication comes from the browser session; a conflicting `key`
/// parameter causes an upstream 400.
const STRIPPED_QUERY_KEY: &str = "key";

/// Harm categories pinned on every forwarded JSON body.
const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

const FORCED_THRESHOLD: &str = "BLOCK_NONE";

/// Collapse the first doubled models segment.
pub fn repair_path(path: &str) -> String {
    if path.contains(DOUBLED_MODELS_SEGMENT) {
        info!(path = %path, "repairing doubled models segment");
        path.replacen(DOUBLED_MODELS_SEGMENT, "/models/", 1)
    } else {
        path.to_string()
    }
}

/// Remove credential-bearing query parameters, preserving everything else
/// including repeated keys.
pub fn strip_query_pairs(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter(|(key, _)| key != STRIPPED_QUERY_KEY)
        .collect()
}

/// One entry of the forced safety-settings list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// The fixed list written into every forwarded JSON body.
pub fn forced_safety_settings() -> Vec<SafetySetting> {
    SAFETY_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: FORCED_THRESHOLD.to_string(),
        })
        .collect()
}

/// Known fields of an upstream generation body. Everything else rides
/// along untouched in `rest`, so unknown fields round-trip exactly.
#[derive(Debug, Serialize, Deserialize)]
struct GenerationBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,

    #[serde(
        rename = "safetySettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    safety_settings: Option<Value>,

    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Rewrite a request body before forwarding.
///
/// A JSON object loses any non-empty `tools` list and gets the forced
/// safety settings; any other payload is returned unchanged.
pub fn rewrite_body(body: &str) -> String {
    let mut parsed: GenerationBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => return body.to_string(),
    };

    if parsed
        .tools
        .as_ref()
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty())
    {
        parsed.tools = None;
    }
    parsed.safety_settings =
        serde_json::to_value(forced_safety_settings()).ok();

    serde_json::to_string(&parsed).unwrap_or_else(|_| body.to_string())
}
