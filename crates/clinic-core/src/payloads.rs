//! Typed payloads of the core frame types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::{QueryContext, QueryOptions};

/// Client `hello`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Protocol version the client speaks.
    #[serde(default)]
    pub version: Option<String>,
    /// Bearer JWT. A leading `Bearer ` is tolerated.
    #[serde(default)]
    pub token: Option<String>,
    /// Capabilities the client would like to use.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form client description, for logs only.
    #[serde(default)]
    pub client_info: Option<Value>,
}

/// Server `hello`, sent on accept and again when the handshake succeeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    /// Protocol version of this server.
    pub version: String,
    /// Versions a client may request.
    pub supported_versions: Vec<String>,
    /// Server capabilities (before the handshake) or the negotiated subset (after).
    pub capabilities: Vec<String>,
    /// Connection id assigned by the registry.
    pub connection_id: String,
    /// Whether the connection is authenticated.
    pub authenticated: bool,
    /// Authenticated user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Transport heartbeat period.
    pub heartbeat_interval_ms: u64,
}

/// Body of a `query` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    /// Question text.
    pub query: String,
    /// Conversational context.
    #[serde(default)]
    pub context: QueryContext,
    /// Execution options.
    #[serde(default)]
    pub options: QueryOptions,
}

/// Body of a `feedback` frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackPayload {
    /// Message being rated.
    pub message_id: String,
    /// Rating in `1..=5`.
    pub rating: u8,
    /// Optional free text.
    #[serde(default)]
    pub comment: Option<String>,
}

/// Body of a `session_update` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdatePayload {
    /// Keys merged into the session context.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Extend the expiry to `now + TTL` (never shortens it).
    #[serde(default)]
    pub renew: bool,
    /// Deactivate or reactivate the session.
    #[serde(default)]
    pub active: Option<bool>,
}

/// Body of a `context_update` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdatePayload {
    /// Keys merged into the session context.
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Body of a `cancel` frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    /// Id of the `query` frame to cancel.
    pub query_id: String,
}

/// Body of `subscribe` / `unsubscribe` frames.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    /// Broadcast topics.
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Body of a `streaming_chunk` frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingChunk {
    /// Query the chunk belongs to.
    pub query_id: String,
    /// Zero-based chunk index.
    pub index: usize,
    /// Total number of chunks.
    pub total: usize,
    /// Chunk text.
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_defaults_when_empty() {
        let hello: HelloPayload = serde_json::from_value(json!({})).unwrap();
        assert!(hello.version.is_none());
        assert!(hello.token.is_none());
        assert!(hello.capabilities.is_empty());
    }

    #[test]
    fn query_payload_defaults_context_and_options() {
        let q: QueryPayload = serde_json::from_value(json!({"query": "oi"})).unwrap();
        assert_eq!(q.query, "oi");
        assert!(!q.options.streaming);
        assert!(q.context.previous_topics.is_empty());
    }

    #[test]
    fn feedback_rejects_fractional_rating() {
        let r = serde_json::from_value::<FeedbackPayload>(json!({"messageId": "m", "rating": 4.5}));
        assert!(r.is_err());
    }

    #[test]
    fn server_hello_omits_missing_user() {
        let hello = ServerHello {
            version: "1.0.0".into(),
            supported_versions: vec!["1.0.0".into()],
            capabilities: vec![],
            connection_id: "conn_1".into(),
            authenticated: false,
            user_id: None,
            heartbeat_interval_ms: 30_000,
        };
        let v = serde_json::to_value(hello).unwrap();
        assert!(v.get("userId").is_none());
        assert_eq!(v["heartbeatIntervalMs"], 30_000);
    }
}
