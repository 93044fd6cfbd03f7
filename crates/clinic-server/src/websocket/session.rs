//! Lifecycle of a single upgraded socket, from registration to cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::connection::{CLOSE_POLICY_VIOLATION, Connection, Outbound, RegistryError};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_REJECTED_TOTAL, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::router::MessageRouter;

/// How long cleanup waits for the writer to flush a close frame.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, WsMessage>;

fn close_frame(code: u16, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Drive one client socket until either side closes it.
///
/// 1. Registers the connection (refusing with 1008 at capacity), which
///    queues the server `hello`
/// 2. Forwards the outbound queue to the socket and pings every heartbeat
///    interval; a peer silent for a whole interval is dropped
/// 3. Feeds text and binary frames to the router
/// 4. Unregisters and cancels the connection's queries on exit
#[instrument(skip_all, fields(%address))]
pub async fn run_ws_session(
    mut ws: WebSocket,
    address: SocketAddr,
    user_agent: Option<String>,
    router: Arc<MessageRouter>,
) {
    let ctx = router.context().clone();
    let (tx, rx) = mpsc::channel(ctx.settings.server.outbound_queue.max(1));

    let connection = match ctx.connections.register(address, user_agent, tx) {
        Ok(connection) => connection,
        Err(RegistryError::Full { limit }) => {
            counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
            debug!(limit, "refusing socket at capacity");
            let reason = RegistryError::Full { limit }.to_string();
            let _ = ws.send(close_frame(CLOSE_POLICY_VIOLATION, &reason)).await;
            return;
        }
    };
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    let started = std::time::Instant::now();
    info!(conn_id = %connection.id, "client connected");

    let (sink, mut stream) = ws.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        connection.clone(),
        ctx.connections.heartbeat_interval(),
    ));

    let mut reason = "client closed";
    loop {
        let frame = tokio::select! {
            () = connection.closed().cancelled() => {
                reason = "closed by server";
                break;
            }
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                router.handle(&connection.id, text.as_str().as_bytes()).await;
            }
            Some(Ok(WsMessage::Binary(data))) => {
                router.handle(&connection.id, &data).await;
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => connection.mark_alive(),
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(code = frame.as_ref().map(|f| f.code), "client sent close frame");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                reason = "transport error";
                break;
            }
            None => break,
        }
    }

    let _ = ctx.connections.unregister(&connection.id, reason);
    let cancelled = ctx.orchestrator.cancel_for_connection(&connection.id);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(
        conn_id = %connection.id,
        reason,
        cancelled_queries = cancelled,
        messages = connection.message_count(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

/// Forward queued frames and heartbeat pings to the socket.
///
/// Ends (and fires the connection's `closed` token) after a close frame,
/// a write failure, a missed heartbeat or once the connection is removed.
async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
    heartbeat: Duration,
) {
    let mut ping = tokio::time::interval(heartbeat);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            () = connection.closed().cancelled() => break,
            item = rx.recv() => match item {
                Some(Outbound::Frame(text)) => {
                    if sink.send(WsMessage::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    debug!(conn_id = %connection.id, code, %reason, "sending close frame");
                    let _ = sink.send(close_frame(code, &reason)).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if !connection.check_alive() {
                    warn!(conn_id = %connection.id, ?heartbeat, "heartbeat missed, dropping connection");
                    break;
                }
                if sink.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    connection.closed().cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_carries_code_and_reason() {
        match close_frame(1008, "Maximum connections reached") {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.as_str(), "Maximum connections reached");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
