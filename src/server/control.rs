//! Control-channel manager: accepts the agent's WebSocket and moves
//! frames between it and the pending table.
//!
//! At most one agent is bound. A newly accepted connection displaces the
//! previous one without grace, and the displaced connection's in-flight
//! requests are failed immediately. An inbound frame that fails to decode
//! is logged and skipped; it never terminates the socket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::protocol::EventFrame;
use crate::server::binding::{BoundBrowser, BrowserBinding};
use crate::server::pending::{InboundEvent, PendingTable};

/// Outbound frame queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// WebSocket listener for the browser plane.
pub struct ControlServer {
    config: Arc<BridgeConfig>,
    table: Arc<PendingTable>,
    binding: Arc<BrowserBinding>,
}

impl ControlServer {
    pub fn new(
        config: Arc<BridgeConfig>,
        table: Arc<PendingTable>,
        binding: Arc<BrowserBinding>,
    ) -> Self {
        Self {
            config,
            table,
            binding,
        }
    }

    /// Accept agent connections until `shutdown` is cancelled.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    continue;
                }
            };
            debug!(peer = %peer, "control connection accepted");

            let table = Arc::clone(&self.table);
            let binding = Arc::clone(&self.binding);
            let max_frame = self.config.control.max_frame_bytes;
            tokio::spawn(async move {
                handle_connection(stream, max_frame, table, binding).await;
            });
        }
        info!("control listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    max_frame: usize,
    table: Arc<PendingTable>,
    binding: Arc<BrowserBinding>,
) {
    // Permessage-deflate stays off; compressing 100 MiB frames has proven
    // unstable. Only the size limits are raised.
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(max_frame))
        .max_frame_size(Some(max_frame));
    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "control handshake failed");
            return;
        }
    };

    let generation = binding.next_generation();
    let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();
    if let Some(displaced) = binding.bind(BoundBrowser {
        generation,
        frames: frames_tx,
        cancel: cancel.clone(),
    }) {
        warn!(
            displaced = displaced.generation,
            generation, "new agent connection displaces the bound one"
        );
        displaced.cancel.cancel();
        fail_pending(&table, displaced.generation, "displaced");
    }
    info!(generation, "agent bound");

    run_session(ws, frames_rx, cancel, &table).await;

    if binding.release(generation) {
        info!(generation, "agent disconnected");
        fail_pending(&table, generation, "disconnected");
    }
}

/// Fail every request issued to a connection that is now gone.
fn fail_pending(table: &PendingTable, generation: u64, reason: &str) {
    let drained = table.drain_up_to(generation);
    if drained.is_empty() {
        return;
    }
    warn!(count = drained.len(), reason, "failing in-flight requests");
    for (id, entry) in drained {
        debug!(
            request_id = %id,
            age_ms = entry.age().as_millis() as u64,
            "dropping pending request"
        );
        entry.deliver_now(InboundEvent::Disconnected);
    }
}

/// Drive one bound connection: outbound request specs from the channel,
/// inbound event frames to the table. A single task serializes writes.
async fn run_session(
    ws: WebSocketStream<TcpStream>,
    mut frames_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    table: &PendingTable,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outbound = frames_rx.recv() => {
                let Some(frame) = outbound else { break };
                if let Err(e) = sink.send(Message::text(frame)).await {
                    warn!(error = %e, "control send failed");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(raw))) => dispatch_frame(table, raw.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "control read failed");
                    break;
                }
            }
        }
    }
}

/// Route one inbound frame to its pending entry.
///
/// Terminal events retire the entry before delivery, so a duplicate
/// terminal finds nothing and becomes a no-op. Unknown ids and
/// undecodable frames are dropped with a log and mutate nothing.
async fn dispatch_frame(table: &PendingTable, raw: &str) {
    let frame = match EventFrame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping undecodable control frame");
            return;
        }
    };
    let EventFrame { request_id, event } = frame;

    if event.is_terminal() {
        match table.take(&request_id) {
            Some(entry) => {
                let _ = entry.deliver(InboundEvent::Frame(event)).await;
            }
            None => debug!(request_id = %request_id, "dropping terminal frame for unknown request"),
        }
        return;
    }

    let Some(tx) = table.sender(&request_id) else {
        debug!(request_id = %request_id, "dropping frame for unknown request");
        return;
    };
    if tx.send(InboundEvent::Frame(event)).await.is_err() {
        // The local client went away; this write failure retires the entry.
        table.take(&request_id);
        debug!(request_id = %request_id, "client gone, entry dropped");
    }
}
