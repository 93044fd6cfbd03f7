//! Lifecycle notifications published on the gateway event bus.
//!
//! Events are observations, never control flow: dropping every one of
//! them must not change how a frame is processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;

/// Every event the gateway publishes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Transport accepted and registered.
    Connected {
        /// Connection id.
        connection_id: String,
        /// Peer address.
        address: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// Handshake succeeded.
    Authenticated {
        /// Connection id.
        connection_id: String,
        /// Verified user.
        user_id: String,
    },
    /// Connection removed from the registry.
    Disconnected {
        /// Connection id.
        connection_id: String,
        /// Why it closed.
        reason: String,
    },
    /// New session created.
    SessionCreated {
        /// Session id.
        session_id: String,
        /// Owner.
        user_id: String,
    },
    /// Session removed by the expiry sweep.
    SessionExpired {
        /// Session id.
        session_id: String,
        /// Owner.
        user_id: String,
    },
    /// Query accepted for execution.
    QueryStarted {
        /// Query id.
        query_id: String,
        /// Session id.
        session_id: String,
    },
    /// Query answered.
    QueryCompleted {
        /// Query id.
        query_id: String,
        /// Session id.
        session_id: String,
        /// Served from cache.
        cached: bool,
        /// Processing time.
        processing_time_ms: u64,
    },
    /// Query failed with an error code.
    QueryFailed {
        /// Query id.
        query_id: String,
        /// Session id.
        session_id: String,
        /// Error code sent to the client.
        code: ErrorCode,
    },
    /// Query cancelled before completion.
    QueryAborted {
        /// Query id.
        query_id: String,
        /// Session id.
        session_id: String,
        /// `cancelled`, `disconnected` or `shutdown`.
        reason: String,
    },
    /// User question recorded in the conversation.
    UserMessage {
        /// Session id.
        session_id: String,
        /// Author.
        user_id: String,
        /// Question text.
        content: String,
    },
    /// Agent answer recorded in the conversation.
    AssistantResponse {
        /// Session id.
        session_id: String,
        /// Query answered.
        query_id: String,
        /// Answer text.
        content: String,
    },
}

impl GatewayEvent {
    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Authenticated { .. } => "authenticated",
            Self::Disconnected { .. } => "disconnected",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionExpired { .. } => "session_expired",
            Self::QueryStarted { .. } => "query_started",
            Self::QueryCompleted { .. } => "query_completed",
            Self::QueryFailed { .. } => "query_failed",
            Self::QueryAborted { .. } => "query_aborted",
            Self::UserMessage { .. } => "user_message",
            Self::AssistantResponse { .. } => "assistant_response",
        }
    }

    /// Session the event concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionExpired { session_id, .. }
            | Self::QueryStarted { session_id, .. }
            | Self::QueryCompleted { session_id, .. }
            | Self::QueryFailed { session_id, .. }
            | Self::QueryAborted { session_id, .. }
            | Self::UserMessage { session_id, .. }
            | Self::AssistantResponse { session_id, .. } => Some(session_id),
            Self::Connected { .. } | Self::Authenticated { .. } | Self::Disconnected { .. } => {
                None
            }
        }
    }

    /// Subscription topic clients use to receive this event.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Connected { .. } | Self::Authenticated { .. } | Self::Disconnected { .. } => {
                "connections"
            }
            Self::SessionCreated { .. } | Self::SessionExpired { .. } => "sessions",
            Self::QueryStarted { .. }
            | Self::QueryCompleted { .. }
            | Self::QueryFailed { .. }
            | Self::QueryAborted { .. } => "queries",
            Self::UserMessage { .. } | Self::AssistantResponse { .. } => "conversation",
        }
    }
}
