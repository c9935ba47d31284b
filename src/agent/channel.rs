//! Control-channel client: single socket, automatic reconnect, in-flight
//! abort on drop.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetch::{FetchError, Fetcher};
use super::stream;
use crate::config::AgentConfig;
use crate::protocol::{EventFrame, RequestSpec};

/// Outbound frame queue depth per session.
const OUTBOUND_QUEUE: usize = 64;

/// Outbound frame handle given to request tasks.
///
/// Once the session that created it is gone, sends are dropped with an
/// error log; late emits from aborted fetches land here harmlessly.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<String>,
}

impl FrameSender {
    pub async fn send(&self, frame: &EventFrame) {
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(request_id = %frame.request_id, error = %e, "frame failed to encode");
                return;
            }
        };
        if self.tx.send(encoded).await.is_err() {
            error!(request_id = %frame.request_id, "control channel is down, dropping frame");
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// The browser-plane runtime. Owns the reconnect loop and, per session,
/// the registry of in-flight requests.
pub struct AgentRuntime {
    config: AgentConfig,
    fetcher: Fetcher,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        let fetcher = Fetcher::new(config.upstream_base.clone(), config.retry.clone());
        Self { config, fetcher }
    }

    /// Connect and serve until `shutdown` fires. Reconnects forever with
    /// a fixed delay; every disconnect aborts the requests spawned under
    /// that session.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                connected = self.connect() => connected,
            };
            match connected {
                Ok(ws) => {
                    info!(url = %self.config.control_url, "control channel connected");
                    self.serve_session(ws, &shutdown).await;
                    info!("control channel disconnected");
                }
                Err(e) => {
                    warn!(url = %self.config.control_url, error = %e, "control connect failed");
                }
            }
            if shutdown.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_frame_bytes))
            .max_frame_size(Some(self.config.max_frame_bytes));
        let (ws, _response) = tokio_tungstenite::connect_async_with_config(
            self.config.control_url.as_str(),
            Some(ws_config),
            false,
        )
        .await?;
        Ok(ws)
    }

    /// Serve one connected session until the socket drops or shutdown.
    async fn serve_session(&self, ws: WsStream, shutdown: &CancellationToken) {
        let (mut sink, mut inbound) = ws.split();
        let (frames_tx, mut frames_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let sender = FrameSender { tx: frames_tx };
        let inflight: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if let Err(e) = sink.send(Message::text(frame)).await {
                    warn!(error = %e, "control send failed");
                    break;
                }
            }
        });

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbound.next() => message,
            };
            match message {
                Some(Ok(Message::Text(raw))) => {
                    self.spawn_request(raw.as_str(), &sender, &inflight);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "control read failed");
                    break;
                }
            }
        }

        // The channel is down: abort everything still in flight. Frames
        // those tasks were about to emit have nowhere to go.
        for entry in inflight.iter() {
            entry.value().cancel();
        }
        drop(sender);
        writer.abort();
    }

    fn spawn_request(
        &self,
        raw: &str,
        sender: &FrameSender,
        inflight: &Arc<DashMap<String, CancellationToken>>,
    ) {
        let spec = match RequestSpec::decode(raw) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "dropping undecodable request frame");
                return;
            }
        };
        debug!(
            request_id = %spec.request_id,
            method = %spec.method,
            path = %spec.path,
            "request received"
        );

        let cancel = CancellationToken::new();
        inflight.insert(spec.request_id.clone(), cancel.clone());

        let fetcher = self.fetcher.clone();
        let frames = sender.clone();
        let registry = Arc::clone(inflight);
        tokio::spawn(async move {
            handle_request(&fetcher, &spec, &frames, &cancel).await;
            registry.remove(&spec.request_id);
        });
    }
}

async fn handle_request(
    fetcher: &Fetcher,
    spec: &RequestSpec,
    frames: &FrameSender,
    cancel: &CancellationToken,
) {
    match fetcher.fetch(spec, cancel).await {
        Ok(response) => stream::relay_response(&spec.request_id, response, frames, cancel).await,
        Err(FetchError::Aborted) => {
            debug!(request_id = %spec.request_id, "request aborted");
        }
        Err(e) => {
            warn!(request_id = %spec.request_id, error = %e, "request failed");
            frames
                .send(&EventFrame::error(&spec.request_id, e.status(), e.to_string()))
                .await;
        }
    }
}
