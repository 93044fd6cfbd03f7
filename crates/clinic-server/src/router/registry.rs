//! Handler trait and the type → handler table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clinic_core::errors::GatewayError;
use clinic_core::ids::{SessionId, UserId};
use clinic_core::message::{Message, MessageType};

use super::context::RouterContext;
use crate::connection::Connection;
use crate::session::Session;

/// A frame that passed every pipeline stage, ready for its handler.
pub struct HandlerRequest {
    /// Originating connection.
    pub connection: Arc<Connection>,
    /// Parsed frame.
    pub message: Message,
    /// Session the frame refers to, when it exists and belongs to the caller.
    pub session: Option<Session>,
}

impl HandlerRequest {
    /// Authenticated caller. Only `hello` and `ping` run without one.
    pub fn user_id(&self) -> Result<UserId, GatewayError> {
        self.connection
            .user_id()
            .ok_or_else(|| GatewayError::AuthenticationFailed("handshake required".into()))
    }

    /// Session id named by the frame.
    pub fn session_id(&self) -> Result<SessionId, GatewayError> {
        self.message.session().ok_or_else(|| {
            GatewayError::InvalidMessage(format!("invalid sessionId {:?}", self.message.session_id))
        })
    }
}

/// Implemented by every message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one frame. `Ok(Some(reply))` is sent back to the caller;
    /// `Ok(None)` means the handler answers on its own (or not at all).
    async fn handle(
        &self,
        request: &HandlerRequest,
        ctx: &RouterContext,
    ) -> Result<Option<Message>, GatewayError>;
}

/// Map from message type to handler, populated at startup.
pub struct HandlerTable {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(&mut self, message_type: MessageType, handler: impl MessageHandler + 'static) {
        let _ = self.handlers.insert(message_type, Arc::new(handler));
    }

    /// Handler for `message_type`.
    pub fn get(&self, message_type: &MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    /// Whether `message_type` has a handler.
    pub fn has(&self, message_type: &MessageType) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().map(|t| t.as_str().to_owned()).collect();
        names.sort();
        names
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(
            &self,
            _request: &HandlerRequest,
            _ctx: &RouterContext,
        ) -> Result<Option<Message>, GatewayError> {
            Ok(None)
        }
    }

    #[test]
    fn lookup_is_by_exact_type() {
        let mut table = HandlerTable::new();
        table.register(MessageType::Ping, Noop);
        table.register(MessageType::Extension("inventory_lookup".into()), Noop);
        assert!(table.has(&MessageType::Ping));
        assert!(table.has(&MessageType::from("inventory_lookup")));
        assert!(!table.has(&MessageType::Pong));
        assert!(table.get(&MessageType::from("inventory")).is_none());
        assert_eq!(table.types(), ["inventory_lookup", "ping"]);
    }
}
