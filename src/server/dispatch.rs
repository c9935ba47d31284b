//! Per-request dispatch: the server-side state machine.
//!
//! Each local request is assigned an id, rewritten, transmitted on the
//! control channel, then driven entirely by the events the agent sends
//! back under that id. The first event decides the response head; every
//! later event flows through the streaming body. Idle expiry, agent
//! disconnects and terminal frames each end a request exactly once, and
//! bytes reach the client in exact frame-arrival order.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::policy::headers::{
    filter_response_headers, salvage_content_type, sanitize_request_headers,
};
use crate::policy::rewrite::{repair_path, rewrite_body, strip_query_pairs};
use crate::protocol::{Event, QueryValue, RequestSpec};
use crate::server::pending::{InboundEvent, PendingEntry, PendingGuard};
use crate::server::AppState;

/// Verbs the bridge forwards.
const FORWARDED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

/// Methods that carry a request body upstream.
const BODY_METHODS: &[Method] = &[Method::POST, Method::PUT, Method::PATCH];

/// Queue depth for per-request inbound events. A full queue exerts
/// backpressure on the control-channel receive loop.
const EVENT_QUEUE: usize = 32;

/// Allocates process-unique request ids: wall clock plus a monotonic
/// counter, so ids also sort roughly by creation time in logs.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    counter: AtomicU64,
}

impl RequestIdAllocator {
    pub fn next_id(&self) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("{millis}-{sequence}")
    }
}

/// Forward one local request through the control channel.
pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    if !FORWARDED_METHODS.contains(&method) {
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            &format!("{method} is not forwarded"),
            None,
        );
    }

    let Some((generation, control_tx)) = state.binding.bound() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Browser not connected",
            "no agent is bound to the control channel; start bridge-agent with the logged-in session available",
            None,
        );
    };

    let path = repair_path(request.uri().path());
    let query_params = sanitized_query(request.uri().query());
    let headers = sanitize_request_headers(request.headers());

    let body = if BODY_METHODS.contains(&method) {
        let limit = state.config.limits.max_body_bytes;
        match to_bytes(request.into_body(), limit).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(rewrite_body(&String::from_utf8_lossy(&bytes))),
            Err(e) => {
                return error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Body too large",
                    &e.to_string(),
                    None,
                )
            }
        }
    } else {
        None
    };

    let request_id = state.ids.next_id();
    let spec = RequestSpec {
        request_id: request_id.clone(),
        method: method.as_str().to_string(),
        path,
        query_params,
        headers,
        body,
    };
    let raw = match spec.encode() {
        Ok(raw) => raw,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "request spec failed to encode");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "request could not be encoded",
                Some(&request_id),
            );
        }
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    if let Err(e) = state
        .table
        .insert(&request_id, PendingEntry::new(events_tx, generation))
    {
        error!(request_id = %request_id, error = %e, "pending insert failed");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            &e.to_string(),
            Some(&request_id),
        );
    }
    // From here on the guard owns the table entry: whatever path this
    // request takes, dropping the guard retires it.
    let guard = state.table.removal_guard(request_id.clone());

    debug!(request_id = %request_id, method = %method, "transmitting request");
    if control_tx.send(raw).await.is_err() {
        warn!(request_id = %request_id, "control channel closed before transmit");
        return error_response(
            StatusCode::BAD_GATEWAY,
            "Browser disconnected",
            "the control channel closed before the request was transmitted",
            Some(&request_id),
        );
    }

    await_response(&state, request_id, events_rx, guard).await
}

/// Wait for the first event, which decides the response head.
async fn await_response(
    state: &AppState,
    request_id: String,
    mut events: mpsc::Receiver<InboundEvent>,
    guard: PendingGuard,
) -> Response {
    let progress_idle = state.config.timeouts.progress_idle();

    let first = match timeout(state.config.timeouts.initial_idle(), events.recv()).await {
        Ok(event) => event,
        Err(_) => {
            warn!(request_id = %request_id, "no response within the initial idle window");
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Request timeout",
                "the agent produced no response in time",
                Some(&request_id),
            );
        }
    };

    match first {
        Some(InboundEvent::Frame(Event::ResponseHeaders { status, headers })) => {
            debug!(request_id = %request_id, status, "response head received");
            let mut headers = filter_response_headers(&headers);
            salvage_content_type(&mut headers, status);
            stream_response(status, headers, None, events, guard, progress_idle, request_id)
        }
        Some(InboundEvent::Frame(Event::Chunk { data })) => {
            // Data before the head is a protocol violation; commit a
            // synthetic event-stream head so no byte is reordered or lost.
            warn!(request_id = %request_id, "chunk before response_headers, synthesizing head");
            let mut headers = BTreeMap::new();
            headers.insert("content-type".to_string(), "text/event-stream".to_string());
            stream_response(200, headers, Some(data), events, guard, progress_idle, request_id)
        }
        Some(InboundEvent::Frame(Event::StreamClose)) => {
            debug!(request_id = %request_id, "stream closed before any data");
            StatusCode::OK.into_response()
        }
        Some(InboundEvent::Frame(Event::Error { status, message })) => {
            warn!(request_id = %request_id, status, message = %message, "agent reported failure");
            let code = StatusCode::from_u16(status)
                .ok()
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(code, "Upstream request failed", &message, Some(&request_id))
        }
        Some(InboundEvent::Disconnected) | None => {
            warn!(request_id = %request_id, "agent disconnected before the response head");
            error_response(
                StatusCode::BAD_GATEWAY,
                "Browser disconnected",
                "the agent connection dropped mid-request",
                Some(&request_id),
            )
        }
    }
}

/// State threaded through the body stream. Holding the guard here ties
/// entry removal to the stream's lifetime.
struct BodyStreamState {
    events: mpsc::Receiver<InboundEvent>,
    buffered: Option<String>,
    idle: Duration,
    request_id: String,
    done: bool,
    _guard: PendingGuard,
}

/// Commit the response head and replay chunk frames as the body.
fn stream_response(
    status: u16,
    headers: BTreeMap<String, String>,
    first_chunk: Option<String>,
    events: mpsc::Receiver<InboundEvent>,
    guard: PendingGuard,
    idle: Duration,
    request_id: String,
) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);

    let mut builder = Response::builder().status(code);
    for (name, value) in &headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(request_id = %request_id, header = %name, "skipping invalid response header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!(request_id = %request_id, header = %name, "skipping invalid response header value");
            continue;
        };
        builder = builder.header(name, value);
    }

    let state = BodyStreamState {
        events,
        buffered: first_chunk,
        idle,
        request_id,
        done: false,
        _guard: guard,
    };
    let body = Body::from_stream(stream::unfold(state, next_body_piece));

    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "response head rejected");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                &e.to_string(),
                None,
            )
        }
    }
}

/// Yield the next body piece, or end the stream.
///
/// Ends cleanly on `stream_close` and on a mid-stream `error` frame (the
/// head is already committed, so the response is finalized as-is); yields
/// an error that aborts the client connection on disconnect or idle
/// expiry. The head is frozen at this point, so a late duplicate
/// `response_headers` is ignored.
async fn next_body_piece(
    mut state: BodyStreamState,
) -> Option<(Result<String, io::Error>, BodyStreamState)> {
    if state.done {
        return None;
    }
    if let Some(data) = state.buffered.take() {
        return Some((Ok(data), state));
    }
    loop {
        match timeout(state.idle, state.events.recv()).await {
            Ok(Some(InboundEvent::Frame(Event::Chunk { data }))) => {
                return Some((Ok(data), state));
            }
            Ok(Some(InboundEvent::Frame(Event::StreamClose))) => {
                debug!(request_id = %state.request_id, "stream complete");
                state.done = true;
                return None;
            }
            Ok(Some(InboundEvent::Frame(Event::Error { status, message }))) => {
                warn!(request_id = %state.request_id, status, message = %message, "mid-stream failure, finalizing response");
                state.done = true;
                return None;
            }
            Ok(Some(InboundEvent::Frame(Event::ResponseHeaders { .. }))) => {
                warn!(request_id = %state.request_id, "duplicate response_headers ignored");
            }
            Ok(Some(InboundEvent::Disconnected)) | Ok(None) => {
                warn!(request_id = %state.request_id, "agent disconnected mid-stream");
                state.done = true;
                return Some((
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "browser disconnected",
                    )),
                    state,
                ));
            }
            Err(_) => {
                warn!(request_id = %state.request_id, "idle window elapsed mid-stream, closing response");
                state.done = true;
                return Some((
                    Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                    state,
                ));
            }
        }
    }
}

/// Parse and sanitize the raw query string into the forwarded shape,
/// folding repeated keys into lists.
fn sanitized_query(query: Option<&str>) -> BTreeMap<String, QueryValue> {
    let Some(query) = query else {
        return BTreeMap::new();
    };
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let mut out: BTreeMap<String, QueryValue> = BTreeMap::new();
    for (key, value) in strip_query_pairs(pairs) {
        match out.remove(&key) {
            None => {
                out.insert(key, QueryValue::Single(value));
            }
            Some(QueryValue::Single(existing)) => {
                out.insert(key, QueryValue::Multi(vec![existing, value]));
            }
            Some(QueryValue::Multi(mut values)) => {
                values.push(value);
                out.insert(key, QueryValue::Multi(values));
            }
        }
    }
    out
}

fn error_response(
    status: StatusCode,
    error: &str,
    message: &str,
    request_id: Option<&str>,
) -> Response {
    let mut body = json!({ "error": error, "message": message });
    if let Some(id) = request_id {
        body["request_id"] = json!(id);
    }
    (status, Json(body)).into_response()
}
