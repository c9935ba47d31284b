//! Streams a 2xx upstream response back as framed events.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::FrameSender;
use super::utf8::Utf8Decoder;
use crate::protocol::EventFrame;

/// Relay the response head and body for one request.
///
/// Emits `response_headers` first, one `chunk` per decoded piece in
/// arrival order, then exactly one terminal frame: `stream_close` on
/// clean EOF or a single `error` on mid-stream failure. Cancellation
/// stops the relay without a terminal frame; the channel that would
/// carry it is already gone.
pub async fn relay_response(
    request_id: &str,
    response: reqwest::Response,
    frames: &FrameSender,
    cancel: &CancellationToken,
) {
    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        headers.insert(
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    frames
        .send(&EventFrame::response_headers(request_id, status, headers))
        .await;

    let mut body = response.bytes_stream();
    let mut decoder = Utf8Decoder::new();
    loop {
        let piece = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(request_id = %request_id, "stream aborted");
                return;
            }
            piece = body.next() => piece,
        };
        match piece {
            Some(Ok(bytes)) => {
                let text = decoder.decode(&bytes);
                if !text.is_empty() {
                    frames.send(&EventFrame::chunk(request_id, text)).await;
                }
            }
            Some(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "upstream body failed mid-stream");
                frames
                    .send(&EventFrame::error(
                        request_id,
                        500,
                        format!("stream read failed: {e}"),
                    ))
                    .await;
                return;
            }
            None => break,
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        frames.send(&EventFrame::chunk(request_id, tail)).await;
    }
    frames.send(&EventFrame::stream_close(request_id)).await;
    debug!(request_id = %request_id, "stream complete");
}
