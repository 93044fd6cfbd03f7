//! Built-in message handlers.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use clinic_core::errors::GatewayError;
use clinic_core::events::GatewayEvent;
use clinic_core::ids::QueryId;
use clinic_core::message::{Message, MessageType};
use clinic_core::payloads::{
    CancelPayload, ContextUpdatePayload, FeedbackPayload, HelloPayload, QueryPayload, ServerHello,
    SessionUpdatePayload, SubscriptionPayload,
};
use clinic_core::query::QueryRequest;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::context::RouterContext;
use super::registry::{HandlerRequest, HandlerTable, MessageHandler};
use crate::connection::{AuthError, ConnectionState};
use crate::metrics::AUTH_FAILURES_TOTAL;
use crate::session::{FeedbackRecord, SessionPatch};

/// Table with every built-in handler registered.
pub fn builtin_handlers() -> HandlerTable {
    let mut table = HandlerTable::new();
    table.register(MessageType::Hello, HelloHandler);
    table.register(MessageType::Ping, PingHandler);
    table.register(MessageType::Status, StatusHandler);
    table.register(MessageType::Query, QueryHandler);
    table.register(MessageType::SessionUpdate, SessionUpdateHandler);
    table.register(MessageType::ContextUpdate, ContextUpdateHandler);
    table.register(MessageType::Feedback, FeedbackHandler);
    table.register(MessageType::Cancel, CancelHandler);
    table.register(MessageType::Subscribe, SubscribeHandler);
    table.register(MessageType::Unsubscribe, UnsubscribeHandler);
    table
}

/// Deserialize the payload, treating `null` as an empty object.
fn parse_payload<T: DeserializeOwned>(message: &Message) -> Result<T, GatewayError> {
    let payload = if message.payload.is_null() {
        json!({})
    } else {
        message.payload.clone()
    };
    serde_json::from_value(payload).map_err(|e| {
        GatewayError::InvalidMessage(format!("invalid {} payload: {e}", message.message_type))
    })
}

fn status(request: &Message, body: Value) -> Option<Message> {
    Some(Message::reply_to(request, MessageType::Status, body))
}

/// Client hello: verify credentials, negotiate version and capabilities.
pub struct HelloHandler;

#[async_trait]
impl MessageHandler for HelloHandler {
    #[instrument(skip_all, fields(conn_id = %request.connection.id))]
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let connection = &request.connection;
        if connection.is_active() {
            return Err(GatewayError::InvalidMessage(
                "connection is already authenticated".into(),
            ));
        }
        let hello: HelloPayload = parse_payload(&request.message)?;
        if !connection.transition(ConnectionState::HelloSent, ConnectionState::Authenticating) {
            return Err(GatewayError::AuthenticationFailed(format!(
                "cannot authenticate a connection in state {:?}",
                connection.state()
            )));
        }

        let info = match ctx
            .authenticator
            .handshake(&connection.id, &hello, &ctx.settings.protocol)
        {
            Ok(info) => info,
            Err(e @ AuthError::UnsupportedVersion { .. }) => {
                let _ = connection
                    .transition(ConnectionState::Authenticating, ConnectionState::HelloSent);
                return Err(GatewayError::InvalidMessage(e.to_string()));
            }
            Err(e) => {
                let reason = match &e {
                    AuthError::MissingToken => "missing_token",
                    AuthError::Expired => "expired",
                    _ => "invalid_token",
                };
                counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
                warn!(error = %e, "hello rejected");
                return Err(GatewayError::AuthenticationFailed(e.to_string()));
            }
        };

        let reply = ServerHello {
            version: info.version.clone(),
            supported_versions: ctx.settings.protocol.supported_versions.clone(),
            capabilities: info.capabilities.clone(),
            connection_id: connection.id.to_string(),
            authenticated: true,
            user_id: Some(info.user_id.to_string()),
            heartbeat_interval_ms: u64::try_from(ctx.connections.heartbeat_interval().as_millis())
                .unwrap_or(u64::MAX),
        };
        let user_id = info.user_id.clone();
        if !connection.authenticate(info) {
            return Err(GatewayError::AuthenticationFailed(
                "connection closed during handshake".into(),
            ));
        }
        info!(user_id = %user_id, "connection authenticated");
        ctx.events.publish(GatewayEvent::Authenticated {
            connection_id: connection.id.to_string(),
            user_id: user_id.to_string(),
        });

        Ok(Some(Message::reply_to(
            &request.message,
            MessageType::Hello,
            serde_json::to_value(&reply)?,
        )))
    }
}

/// Application-level ping.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        _ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        Ok(Some(Message::reply_to(
            &request.message,
            MessageType::Pong,
            json!({ "serverTime": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) }),
        )))
    }
}

/// Connection, session and quota summary.
pub struct StatusHandler;

#[async_trait]
impl MessageHandler for StatusHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let connection = &request.connection;
        let registry = ctx.connections.stats();
        Ok(status(
            &request.message,
            json!({
                "state": "ok",
                "connection": connection.info(),
                "session": request.session,
                "rateLimit": ctx.rate_limiter.info(&connection.rate_key()),
                "server": {
                    "version": ctx.settings.protocol.version,
                    "uptimeSecs": ctx.start_time.elapsed().as_secs(),
                    "connections": registry.total,
                    "circuit": ctx.orchestrator.circuit_status(),
                },
            }),
        ))
    }
}

/// Hand a question to the orchestrator.
pub struct QueryHandler;

#[async_trait]
impl MessageHandler for QueryHandler {
    #[instrument(skip_all, fields(query_id = %request.message.id))]
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: QueryPayload = parse_payload(&request.message)?;
        let mut context = payload.context;
        if context.patient_id.is_none() {
            context.patient_id = request
                .session
                .as_ref()
                .and_then(|s| s.context.get("patientId"))
                .and_then(Value::as_str)
                .map(str::to_owned);
        }
        let query = QueryRequest {
            query_id: QueryId::from(request.message.id.as_str()),
            session_id: request.session_id()?,
            user_id: request.user_id()?,
            query: payload.query,
            context,
            options: payload.options,
        };
        debug!(streaming = query.options.streaming, "query accepted");
        ctx.orchestrator.submit(
            request.connection.clone(),
            request.message.clone(),
            query,
        )?;
        Ok(None)
    }
}

/// Patch a session (context, active flag, renewal).
pub struct SessionUpdateHandler;

#[async_trait]
impl MessageHandler for SessionUpdateHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: SessionUpdatePayload = parse_payload(&request.message)?;
        let session = ctx.sessions.update(
            &request.session_id()?,
            SessionPatch {
                context: payload.context,
                active: payload.active,
                renew: payload.renew,
            },
        )?;
        Ok(Some(Message::reply_to(
            &request.message,
            MessageType::SessionUpdate,
            serde_json::to_value(&session)?,
        )))
    }
}

/// Merge keys into the session context.
pub struct ContextUpdateHandler;

#[async_trait]
impl MessageHandler for ContextUpdateHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: ContextUpdatePayload = parse_payload(&request.message)?;
        let session = ctx.sessions.update(
            &request.session_id()?,
            SessionPatch {
                context: payload.context,
                ..SessionPatch::default()
            },
        )?;
        Ok(status(
            &request.message,
            json!({ "state": "context_updated", "context": session.context }),
        ))
    }
}

/// Record a rating of an earlier answer.
pub struct FeedbackHandler;

#[async_trait]
impl MessageHandler for FeedbackHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: FeedbackPayload = parse_payload(&request.message)?;
        let record = FeedbackRecord {
            session_id: request.session_id()?,
            user_id: request.user_id()?,
            message_id: payload.message_id.clone(),
            rating: payload.rating,
            comment: payload.comment,
            received_at: Utc::now(),
        };
        ctx.feedback
            .record(record)
            .await
            .map_err(|e| GatewayError::Database(e.to_string()))?;
        info!(message_id = %payload.message_id, rating = payload.rating, "feedback recorded");
        Ok(status(
            &request.message,
            json!({ "state": "feedback_received", "messageId": payload.message_id }),
        ))
    }
}

/// Abort a query of the caller.
pub struct CancelHandler;

#[async_trait]
impl MessageHandler for CancelHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: CancelPayload = parse_payload(&request.message)?;
        let query_id = QueryId::from(payload.query_id);
        if ctx.orchestrator.cancel(&query_id, &request.user_id()?) {
            Ok(None)
        } else {
            Err(GatewayError::InvalidMessage(format!(
                "no query `{query_id}` in progress"
            )))
        }
    }
}

/// Add event topics.
pub struct SubscribeHandler;

#[async_trait]
impl MessageHandler for SubscribeHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        _ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: SubscriptionPayload = parse_payload(&request.message)?;
        let topics = request.connection.subscribe(payload.topics);
        Ok(status(
            &request.message,
            json!({ "state": "subscribed", "topics": topics }),
        ))
    }
}

/// Remove event topics.
pub struct UnsubscribeHandler;

#[async_trait]
impl MessageHandler for UnsubscribeHandler {
    async fn handle(
        &self,
        request: &HandlerRequest,
        _ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError> {
        let payload: SubscriptionPayload = parse_payload(&request.message)?;
        let topics = request.connection.unsubscribe(&payload.topics);
        Ok(status(
            &request.message,
            json!({ "state": "unsubscribed", "topics": topics }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_core_request_type_has_a_handler() {
        let table = builtin_handlers();
        for t in [
            "hello",
            "ping",
            "status",
            "query",
            "session_update",
            "context_update",
            "feedback",
            "cancel",
            "subscribe",
            "unsubscribe",
        ] {
            assert!(table.has(&MessageType::from(t)), "{t}");
        }
        assert!(!table.has(&MessageType::Response));
        assert!(!table.has(&MessageType::StreamingChunk));
    }

    #[test]
    fn null_payload_reads_as_empty_object() {
        let msg = Message::outbound(MessageType::Hello, "abc12345", Value::Null);
        let hello: HelloPayload = parse_payload(&msg).unwrap();
        assert!(hello.token.is_none());
    }

    #[test]
    fn bad_payload_names_the_type() {
        let msg = Message::outbound(MessageType::Cancel, "abc12345", json!({"queryId": 5}));
        let err = parse_payload::<CancelPayload>(&msg).unwrap_err();
        assert!(err.to_string().contains("cancel"));
    }
}
