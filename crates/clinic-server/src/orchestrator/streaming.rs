//! Chunked delivery of answers.

use std::time::Duration;

use clinic_core::message::{Message, MessageType};
use clinic_core::payloads::StreamingChunk;
use clinic_core::query::QueryResult;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;

/// How a chunked delivery ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every chunk and the end frame were queued.
    Completed,
    /// The token fired; no further frame was sent.
    Cancelled,
}

/// Split `text` into pieces of at most `size` characters.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Stream `result` to `connection` as `streaming_start`, `streaming_chunk`*
/// and `streaming_end` frames answering `request`.
///
/// Emission stops at the first chunk boundary after `cancel` fires.
pub async fn deliver_chunks(
    connection: &Connection,
    request: &Message,
    result: &QueryResult,
    chunk_size: usize,
    delay: Duration,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let query_id = request.id.as_str();
    let chunks = chunk_text(&result.content, chunk_size);
    let total = chunks.len();

    if cancel.is_cancelled() {
        return StreamOutcome::Cancelled;
    }
    let _ = connection.send_message(&Message::reply_to(
        request,
        MessageType::StreamingStart,
        json!({ "queryId": query_id, "totalChunks": total, "cached": result.cached }),
    ));

    for (index, content) in chunks.into_iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(query_id, index, "stream cancelled");
                    return StreamOutcome::Cancelled;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return StreamOutcome::Cancelled;
        }
        let chunk = StreamingChunk {
            query_id: query_id.to_owned(),
            index,
            total,
            content,
        };
        let _ = connection.send_message(&Message::reply_to(
            request,
            MessageType::StreamingChunk,
            serde_json::to_value(&chunk).unwrap_or_default(),
        ));
    }

    if cancel.is_cancelled() {
        return StreamOutcome::Cancelled;
    }
    let mut summary = serde_json::to_value(result).unwrap_or_default();
    if let Some(obj) = summary.as_object_mut() {
        let _ = obj.remove("content");
        let _ = obj.insert("queryId".into(), json!(query_id));
        let _ = obj.insert("totalChunks".into(), json!(total));
    }
    let _ = connection.send_message(&Message::reply_to(request, MessageType::StreamingEnd, summary));
    StreamOutcome::Completed
}
