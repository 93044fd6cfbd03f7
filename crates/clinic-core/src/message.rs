//! Wire envelope shared by every frame in both directions.
//!
//! ```json
//! {
//!   "id": "msg-1",
//!   "type": "query",
//!   "timestamp": "2026-10-17T12:00:00Z",
//!   "sessionId": "abc12345",
//!   "payload": { "query": "horário disponível" },
//!   "metadata": { "requestId": "r-9" }
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::ids::SessionId;

/// Frame type.
///
/// The core protocol types are listed explicitly. Anything else parses as
/// [`MessageType::Extension`] and is only accepted if a handler was
/// registered for that exact name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Handshake, both directions.
    Hello,
    /// Question for the agent backend.
    Query,
    /// Answer to a query.
    Response,
    /// Error report.
    Error,
    /// Status request or notification.
    Status,
    /// Liveness check.
    Ping,
    /// Reply to `ping`.
    Pong,
    /// Patch of session fields.
    SessionUpdate,
    /// Rating of a previous answer.
    Feedback,
    /// Merge into the session context.
    ContextUpdate,
    /// Start of a chunked answer.
    StreamingStart,
    /// One chunk of a chunked answer.
    StreamingChunk,
    /// End of a chunked answer.
    StreamingEnd,
    /// Cancel an in-flight query.
    Cancel,
    /// Subscribe to broadcast topics.
    Subscribe,
    /// Unsubscribe from broadcast topics.
    Unsubscribe,
    /// Domain extension type served by an external handler.
    Extension(String),
}

impl MessageType {
    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hello => "hello",
            Self::Query => "query",
            Self::Response => "response",
            Self::Error => "error",
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::SessionUpdate => "session_update",
            Self::Feedback => "feedback",
            Self::ContextUpdate => "context_update",
            Self::StreamingStart => "streaming_start",
            Self::StreamingChunk => "streaming_chunk",
            Self::StreamingEnd => "streaming_end",
            Self::Cancel => "cancel",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Extension(name) => name,
        }
    }

    /// Types accepted before the handshake completes.
    pub fn allowed_before_handshake(&self) -> bool {
        matches!(self, Self::Hello | Self::Ping)
    }

    /// Types that operate on an existing session and fail when it is gone.
    pub fn requires_existing_session(&self) -> bool {
        matches!(
            self,
            Self::SessionUpdate | Self::ContextUpdate | Self::Feedback
        )
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "hello" => Self::Hello,
            "query" => Self::Query,
            "response" => Self::Response,
            "error" => Self::Error,
            "status" => Self::Status,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "session_update" => Self::SessionUpdate,
            "feedback" => Self::Feedback,
            "context_update" => Self::ContextUpdate,
            "streaming_start" => Self::StreamingStart,
            "streaming_chunk" => Self::StreamingChunk,
            "streaming_end" => Self::StreamingEnd,
            "cancel" => Self::Cancel,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            _ => Self::Extension(s),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Extension(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional envelope metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// User the client claims to act for. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Client correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Payload compression flag. Only `false` or absent is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
    /// Payload encryption flag. Only `false` or absent is accepted;
    /// transport security is left to TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<bool>,
}

impl MessageMetadata {
    /// Name of the first payload encoding this gateway cannot decode.
    fn unsupported_encoding(&self) -> Option<&'static str> {
        if self.compression == Some(true) {
            Some("compression")
        } else if self.encryption == Some(true) {
            Some("encryption")
        } else {
            None
        }
    }
}

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Frame id. For `query` frames this is also the query id.
    pub id: String,
    /// Frame type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender clock, ISO-8601.
    pub timestamp: DateTime<Utc>,
    /// Conversation the frame belongs to. Empty on server frames that are
    /// not tied to a session.
    pub session_id: String,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Value,
    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

const REQUIRED_FIELDS: [&str; 4] = ["id", "type", "timestamp", "sessionId"];

impl Message {
    /// Parse an inbound frame.
    ///
    /// Rejects malformed JSON, non-object frames, missing or non-string
    /// required fields, unparsable timestamps, session ids that do not
    /// match the session id format and payloads flagged as compressed or
    /// encrypted.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| GatewayError::InvalidMessage(format!("malformed JSON: {e}")))?;
        let Some(obj) = value.as_object() else {
            return Err(GatewayError::InvalidMessage(
                "frame must be a JSON object".into(),
            ));
        };
        for field in REQUIRED_FIELDS {
            match obj.get(field) {
                Some(Value::String(s)) if !s.is_empty() => {}
                Some(_) => {
                    return Err(GatewayError::InvalidMessage(format!(
                        "field `{field}` must be a non-empty string"
                    )));
                }
                None => {
                    return Err(GatewayError::InvalidMessage(format!(
                        "missing required field `{field}`"
                    )));
                }
            }
        }
        let message: Self = serde_json::from_value(value)
            .map_err(|e| GatewayError::InvalidMessage(e.to_string()))?;
        if SessionId::parse(&message.session_id).is_none() {
            return Err(GatewayError::InvalidMessage(format!(
                "sessionId {:?} does not match ^[a-zA-Z0-9\\-_]{{8,64}}$",
                message.session_id
            )));
        }
        if let Some(encoding) = message
            .metadata
            .as_ref()
            .and_then(MessageMetadata::unsupported_encoding)
        {
            return Err(GatewayError::InvalidMessage(format!(
                "payload {encoding} is not supported"
            )));
        }
        Ok(message)
    }

    /// Build a server frame with a fresh id and the current time.
    pub fn outbound(message_type: MessageType, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: format!("srv_{}", Uuid::now_v7().simple()),
            message_type,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            payload,
            metadata: None,
        }
    }

    /// Build a server frame answering `request`, echoing its id as `requestId`.
    pub fn reply_to(request: &Self, message_type: MessageType, payload: Value) -> Self {
        let mut reply = Self::outbound(message_type, request.session_id.clone(), payload);
        reply.metadata = Some(MessageMetadata {
            request_id: Some(request.id.clone()),
            ..MessageMetadata::default()
        });
        reply
    }

    /// Build an `error` frame for `err`, optionally tied to the frame that caused it.
    pub fn error(err: &GatewayError, request_id: Option<&str>, session_id: &str) -> Self {
        let mut frame = Self::outbound(MessageType::Error, session_id, err.to_payload());
        if let Some(id) = request_id {
            frame.metadata = Some(MessageMetadata {
                request_id: Some(id.to_owned()),
                ..MessageMetadata::default()
            });
        }
        frame
    }

    /// Validated session id of this frame.
    ///
    /// Always `Some` for frames produced by [`Message::parse`].
    pub fn session(&self) -> Option<SessionId> {
        SessionId::parse(&self.session_id)
    }

    /// Payload as an object, or an empty map when it is not one.
    pub fn payload_object(&self) -> Map<String, Value> {
        self.payload.as_object().cloned().unwrap_or_default()
    }

    /// Absolute clock skew between this frame and `now`, in milliseconds.
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.timestamp).num_milliseconds().unsigned_abs()
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, message_type = %self.message_type, "failed to serialize frame");
            String::from("{}")
        })
    }
}
