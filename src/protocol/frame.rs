//! Frame codec for the control channel.
//!
//! Decoding ignores unknown keys so either plane can evolve independently.
//! An unknown `event_type` is a decode error the receiver logs and drops;
//! it never has a terminal effect on a request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A query parameter value. The upstream accepts repeated keys, so a key
/// may map to a single value or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

/// One outgoing upstream call, server plane to browser plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Unique for the life of the server process.
    pub request_id: String,

    /// HTTP verb, uppercase.
    pub method: String,

    /// Path suffix appended to the fixed upstream host.
    pub path: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, QueryValue>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Present only for methods that carry a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestSpec {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Event frame, browser plane to server plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
    pub request_id: String,

    #[serde(flatten)]
    pub event: Event,
}

/// Per-request progress events.
///
/// For a well-behaved stream the order is `ResponseHeaders`, zero or more
/// `Chunk`s, then exactly one of `StreamClose` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// Upstream status line and header set; once, before any chunk.
    ResponseHeaders {
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    /// One decoded piece of the response body. Concatenation of all
    /// chunks, in arrival order, is the body as UTF-8 text.
    Chunk { data: String },

    /// Terminal: the upstream body ended cleanly.
    StreamClose,

    /// Terminal: the upstream call failed.
    Error {
        #[serde(default)]
        status: u16,
        message: String,
    },
}

impl Event {
    /// Terminal events retire the request on both planes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::StreamClose | Event::Error { .. })
    }
}

impl EventFrame {
    pub fn response_headers(
        request_id: &str,
        status: u16,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            event: Event::ResponseHeaders { status, headers },
        }
    }

    pub fn chunk(request_id: &str, data: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            event: Event::Chunk { data: data.into() },
        }
    }

    pub fn stream_close(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            event: Event::StreamClose,
        }
    }

    pub fn error(request_id: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            event: Event::Error {
                status,
                message: message.into(),
            },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
