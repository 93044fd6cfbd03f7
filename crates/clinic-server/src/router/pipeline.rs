//! The inbound pipeline: parse, freshness, rate limit, handshake and
//! session gate, validation, dispatch.
//!
//! Each stage short-circuits with a [`GatewayError`] that is turned into an
//! `error` frame for the caller. Nothing escapes [`MessageRouter::handle`],
//! panics included.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use clinic_core::errors::GatewayError;
use clinic_core::ids::ConnectionId;
use clinic_core::message::{Message, MessageType};
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::context::RouterContext;
use super::registry::{HandlerRequest, HandlerTable};
use super::validation;
use crate::connection::{CLOSE_POLICY_VIOLATION, Connection};
use crate::metrics::{ERRORS_TOTAL, MESSAGE_DURATION_SECONDS, MESSAGES_TOTAL, RATE_LIMITED_TOTAL};
use crate::session::Session;

/// Longest a single handler may run.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Router counters.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    /// Frames received.
    pub received: u64,
    /// Frames dispatched successfully.
    pub succeeded: u64,
    /// Frames answered with an error.
    pub failed: u64,
    /// Of the failures, rate-limit rejections.
    pub rate_limited: u64,
    /// Of the failures, handshake gate rejections.
    pub auth_failures: u64,
}

#[derive(Default)]
struct StatsCounters {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
}

/// What to say back after processing one frame.
struct Outcome {
    label: &'static str,
    request_id: Option<String>,
    session_id: String,
    result: Result<Option<Message>, GatewayError>,
    close: Option<&'static str>,
}

impl Outcome {
    fn rejected(request_id: Option<String>, session_id: String, err: GatewayError) -> Self {
        Self {
            label: "invalid",
            request_id,
            session_id,
            result: Err(err),
            close: None,
        }
    }
}

/// Routes inbound frames to handlers.
pub struct MessageRouter {
    ctx: Arc<RouterContext>,
    handlers: HandlerTable,
    stats: StatsCounters,
}

impl MessageRouter {
    /// Router over `handlers` with shared dependencies `ctx`.
    pub fn new(ctx: Arc<RouterContext>, handlers: HandlerTable) -> Self {
        Self {
            ctx,
            handlers,
            stats: StatsCounters::default(),
        }
    }

    /// Shared dependencies.
    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    /// Process one raw frame from `connection_id`. Every failure is
    /// answered with an `error` frame on the same connection.
    pub async fn handle(&self, connection_id: &ConnectionId, raw: &[u8]) {
        let Some(connection) = self.ctx.connections.get(connection_id) else {
            debug!(conn_id = %connection_id, "frame for unknown connection dropped");
            return;
        };
        connection.record_activity();
        let _ = self.stats.received.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let outcome = match AssertUnwindSafe(self.process(&connection, raw))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(conn_id = %connection.id, detail = %detail, "message handler panicked");
                Outcome::rejected(None, String::new(), GatewayError::Internal(detail))
            }
        };

        let succeeded = outcome.result.is_ok();
        match outcome.result {
            Ok(Some(reply)) => {
                let _ = connection.send_message(&reply);
            }
            Ok(None) => {}
            Err(err) => {
                let code = err.code();
                counter!(ERRORS_TOTAL, "code" => code.as_str()).increment(1);
                if err.is_retryable() {
                    debug!(conn_id = %connection.id, code = %code, error = %err, "request rejected");
                } else {
                    warn!(conn_id = %connection.id, code = %code, error = %err, "request rejected");
                }
                let _ = connection.send_message(&Message::error(
                    &err,
                    outcome.request_id.as_deref(),
                    &outcome.session_id,
                ));
            }
        }
        if let Some(reason) = outcome.close {
            connection.close(CLOSE_POLICY_VIOLATION, reason);
        }

        let bucket = if succeeded {
            &self.stats.succeeded
        } else {
            &self.stats.failed
        };
        let _ = bucket.fetch_add(1, Ordering::Relaxed);
        counter!(
            MESSAGES_TOTAL,
            "type" => outcome.label,
            "outcome" => if succeeded { "ok" } else { "error" }
        )
        .increment(1);
        histogram!(MESSAGE_DURATION_SECONDS, "type" => outcome.label)
            .record(start.elapsed().as_secs_f64());
    }

    async fn process(&self, connection: &Arc<Connection>, raw: &[u8]) -> Outcome {
        let Ok(text) = std::str::from_utf8(raw) else {
            return Outcome::rejected(
                None,
                String::new(),
                GatewayError::InvalidMessage("frame is not valid UTF-8".into()),
            );
        };

        let message = match Message::parse(text) {
            Ok(m) => m,
            Err(e) => {
                let (id, session_id) = salvage_ids(text);
                return Outcome::rejected(id, session_id, e);
            }
        };
        let label = type_label(&message.message_type);
        let mut outcome = Outcome {
            label,
            request_id: Some(message.id.clone()),
            session_id: message.session_id.clone(),
            result: Ok(None),
            close: None,
        };

        let max_age = self.ctx.settings.protocol.max_message_age_ms();
        let age = message.age_ms(Utc::now());
        if age > max_age {
            outcome.result = Err(GatewayError::InvalidMessage(format!(
                "message timestamp is {age}ms away from server time (max {max_age}ms)"
            )));
            return outcome;
        }

        if let Err(limited) = self.ctx.rate_limiter.check(&connection.rate_key()) {
            let _ = self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            counter!(RATE_LIMITED_TOTAL, "window" => limited.window.as_str()).increment(1);
            outcome.result = Err(GatewayError::RateLimited {
                retry_after_ms: u64::try_from(limited.retry_after.as_millis()).unwrap_or(u64::MAX),
            });
            return outcome;
        }

        if !connection.is_active() && !message.message_type.allowed_before_handshake() {
            let _ = self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            let failures = connection.record_auth_failure();
            if failures >= self.ctx.settings.auth.max_auth_failures {
                outcome.close = Some("Too many authentication failures");
            }
            outcome.result = Err(GatewayError::AuthenticationFailed(format!(
                "handshake required before `{}`",
                message.message_type
            )));
            return outcome;
        }

        let session = match self.session_gate(connection, &message) {
            Ok(session) => session,
            Err(e) => {
                outcome.result = Err(e);
                return outcome;
            }
        };

        if let Err(e) = validation::validate(&message) {
            outcome.result = Err(e);
            return outcome;
        }

        let Some(handler) = self.handlers.get(&message.message_type) else {
            outcome.result = Err(GatewayError::InvalidMessage(format!(
                "unsupported message type `{}`",
                message.message_type
            )));
            return outcome;
        };

        let is_hello = message.message_type == MessageType::Hello;
        let request = HandlerRequest {
            connection: Arc::clone(connection),
            message,
            session,
        };
        outcome.result =
            match tokio::time::timeout(HANDLER_TIMEOUT, handler.handle(&request, &self.ctx)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    error!(message_type = label, "handler timed out after {HANDLER_TIMEOUT:?}");
                    Err(GatewayError::Internal(format!(
                        "handler for `{}` timed out",
                        request.message.message_type
                    )))
                }
            };

        match &outcome.result {
            Ok(_) => {
                if let Some(session) = &request.session {
                    let _ = self.ctx.sessions.touch(&session.id);
                }
            }
            Err(GatewayError::AuthenticationFailed(_)) if is_hello => {
                outcome.close = Some("Authentication failed");
            }
            Err(_) => {}
        }
        outcome
    }

    /// Resolve the session a frame refers to and check it belongs to the
    /// caller. `hello` and `ping` skip the gate.
    fn session_gate(
        &self,
        connection: &Connection,
        message: &Message,
    ) -> Result<Option<Session>, GatewayError> {
        if message.message_type.allowed_before_handshake() {
            return Ok(None);
        }
        let user = connection
            .user_id()
            .ok_or_else(|| GatewayError::AuthenticationFailed("handshake required".into()))?;
        let session_id = message.session().ok_or_else(|| {
            GatewayError::InvalidMessage(format!("invalid sessionId {:?}", message.session_id))
        })?;

        let session = if message.message_type == MessageType::Query {
            Some(self.ctx.sessions.get_or_create(&session_id, &user))
        } else {
            let existing = self.ctx.sessions.get(&session_id);
            if existing.is_none() && message.message_type.requires_existing_session() {
                return Err(GatewayError::SessionExpired(session_id.to_string()));
            }
            existing
        };

        if let Some(session) = &session {
            if session.user_id != user {
                warn!(
                    conn_id = %connection.id,
                    session_id = %session_id,
                    "session belongs to another user"
                );
                return Err(GatewayError::AuthorizationFailed(format!(
                    "session {session_id} belongs to another user"
                )));
            }
            connection.bind_session(session_id);
        }
        Ok(session)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            received: self.stats.received.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            auth_failures: self.stats.auth_failures.load(Ordering::Relaxed),
        }
    }
}

/// Bounded metric label for a message type.
fn type_label(message_type: &MessageType) -> &'static str {
    match message_type {
        MessageType::Hello => "hello",
        MessageType::Query => "query",
        MessageType::Response => "response",
        MessageType::Error => "error",
        MessageType::Status => "status",
        MessageType::Ping => "ping",
        MessageType::Pong => "pong",
        MessageType::SessionUpdate => "session_update",
        MessageType::Feedback => "feedback",
        MessageType::ContextUpdate => "context_update",
        MessageType::StreamingStart => "streaming_start",
        MessageType::StreamingChunk => "streaming_chunk",
        MessageType::StreamingEnd => "streaming_end",
        MessageType::Cancel => "cancel",
        MessageType::Subscribe => "subscribe",
        MessageType::Unsubscribe => "unsubscribe",
        MessageType::Extension(_) => "extension",
    }
}

/// Best-effort `id` / `sessionId` of a frame that failed to parse, so the
/// error can still be correlated.
fn salvage_ids(text: &str) -> (Option<String>, String) {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) else {
        return (None, String::new());
    };
    let id = obj.get("id").and_then(Value::as_str).map(str::to_owned);
    let session_id = obj
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    (id, session_id)
}
