//! Shared utilities for integration testing: an in-process bridge, a
//! scripted fake agent, and a mock upstream.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{any, get};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use browser_bridge::config::BridgeConfig;
use browser_bridge::protocol::{Event, EventFrame, RequestSpec};
use browser_bridge::Bridge;

pub struct TestBridge {
    pub http_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl TestBridge {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }
}

/// Start a bridge on ephemeral ports with the given idle windows.
pub async fn start_bridge(initial_idle_secs: u64, progress_idle_secs: u64) -> TestBridge {
    let mut config = BridgeConfig::default();
    config.timeouts.initial_idle_secs = initial_idle_secs;
    config.timeouts.progress_idle_secs = progress_idle_secs;

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    let control_addr = control_listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let bridge = Bridge::new(config);
    let bridge_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = bridge
            .run(http_listener, control_listener, bridge_shutdown)
            .await;
    });

    TestBridge {
        http_addr,
        control_addr,
        shutdown,
    }
}

pub type AgentSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A scripted stand-in for the browser plane.
pub struct FakeAgent {
    ws: AgentSocket,
}

impl FakeAgent {
    pub async fn connect(control_addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{control_addr}"))
            .await
            .unwrap();
        Self { ws }
    }

    /// Receive the next request spec, skipping non-text frames.
    pub async fn recv_spec(&mut self) -> RequestSpec {
        loop {
            let message = self
                .ws
                .next()
                .await
                .expect("control socket closed while waiting for a spec")
                .unwrap();
            if let Message::Text(raw) = message {
                return RequestSpec::decode(raw.as_str()).unwrap();
            }
        }
    }

    pub async fn send_event(&mut self, frame: &EventFrame) {
        self.ws
            .send(Message::text(frame.encode().unwrap()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.ws.send(Message::text(raw.to_string())).await.unwrap();
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Poll /health until the bridge reports a bound agent.
pub async fn wait_for_agent(bridge: &TestBridge) {
    let client = client();
    for _ in 0..100 {
        if let Ok(res) = client.get(bridge.http_url("/health")).send().await {
            let body: serde_json::Value = res.json().await.unwrap();
            if body["browserConnected"] == true {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent never bound");
}

/// Poll /health until no requests are pending.
pub async fn wait_for_drained(bridge: &TestBridge) {
    let client = client();
    for _ in 0..100 {
        if let Ok(res) = client.get(bridge.http_url("/health")).send().await {
            let body: serde_json::Value = res.json().await.unwrap();
            if body["pendingRequests"] == 0 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pending table never drained");
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// State captured by the mock upstream.
#[derive(Default)]
pub struct UpstreamState {
    pub hits: AtomicU32,
    pub last_body: Mutex<Option<String>>,
    pub last_headers: Mutex<Option<Vec<(String, String)>>>,
}

/// Start a mock upstream with routes the agent tests drive:
/// - `GET /stream` replies 200 and a chunked multi-byte body
/// - `ANY /flaky` fails twice with 503, then replies 200 "ok"
/// - `ANY /broken` always replies 500 "boom"
/// - `ANY /capture` records body and headers, replies 200 "captured"
pub async fn start_mock_upstream() -> (SocketAddr, Arc<UpstreamState>) {
    let state = Arc::new(UpstreamState::default());

    async fn stream_handler(State(state): State<Arc<UpstreamState>>) -> axum::response::Response {
        state.hits.fetch_add(1, Ordering::SeqCst);
        // The split lands inside the two-byte "ö" so a relaying decoder
        // has to carry the partial sequence across chunks.
        const BODY: &[u8] = "data: w\u{00f6}rld\n\n".as_bytes();
        let chunks: Vec<Result<&'static [u8], std::io::Error>> =
            vec![Ok(&BODY[..8]), Ok(&BODY[8..])];
        axum::response::Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(axum::body::Body::from_stream(futures_util::stream::iter(
                chunks,
            )))
            .unwrap()
    }

    async fn flaky_handler(State(state): State<Arc<UpstreamState>>) -> (axum::http::StatusCode, &'static str) {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst);
        if hit < 2 {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not yet")
        } else {
            (axum::http::StatusCode::OK, "ok")
        }
    }

    async fn broken_handler(State(state): State<Arc<UpstreamState>>) -> (axum::http::StatusCode, &'static str) {
        state.hits.fetch_add(1, Ordering::SeqCst);
        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
    }

    async fn capture_handler(
        State(state): State<Arc<UpstreamState>>,
        headers: HeaderMap,
        body: String,
    ) -> &'static str {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let captured: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        *state.last_headers.lock().await = Some(captured);
        *state.last_body.lock().await = Some(body);
        "captured"
    }

    let app = Router::new()
        .route("/stream", get(stream_handler))
        .route("/flaky", any(flaky_handler))
        .route("/broken", any(broken_handler))
        .route("/capture", any(capture_handler))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Collect event frames for one request until a terminal frame arrives.
pub async fn collect_events(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> Vec<EventFrame> {
    let mut events = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for frames")
            .expect("socket closed while collecting frames")
            .unwrap();
        if let Message::Text(raw) = message {
            let frame = EventFrame::decode(raw.as_str()).unwrap();
            let terminal = frame.event.is_terminal();
            events.push(frame);
            if terminal {
                return events;
            }
        }
    }
}

/// Concatenate the chunk payloads of a frame sequence.
pub fn chunk_data(events: &[EventFrame]) -> String {
    events
        .iter()
        .filter_map(|frame| match &frame.event {
            Event::Chunk { data } => Some(data.as_str()),
            _ => None,
        })
        .collect()
}
