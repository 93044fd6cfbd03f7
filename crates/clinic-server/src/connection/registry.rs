//! Live connection registry and targeted delivery.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use clinic_core::events::GatewayEvent;
use clinic_core::ids::{ConnectionId, SessionId, UserId};
use clinic_core::message::{Message, MessageType};
use clinic_core::payloads::ServerHello;
use clinic_settings::{GatewaySettings, ProtocolSettings};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::{CLOSE_NORMAL, Connection, ConnectionInfo, ConnectionState, Outbound};
use crate::events::EventBus;

/// Registration failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The configured connection limit is reached.
    #[error("Maximum connections reached")]
    Full {
        /// Configured limit.
        limit: usize,
    },
}

/// Aggregate connection counts.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Registered connections.
    pub total: usize,
    /// Connections that completed the handshake.
    pub authenticated: usize,
    /// Connections still in the handshake.
    pub pending: usize,
    /// Configured limit.
    pub max_connections: usize,
    /// Connections accepted since start.
    pub accepted_total: u64,
    /// Connections refused at capacity since start.
    pub rejected_total: u64,
    /// Outbound frames dropped across live connections.
    pub dropped_messages: u64,
}

/// Owns every live [`Connection`].
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    reserved: AtomicUsize,
    max_connections: usize,
    protocol: ProtocolSettings,
    heartbeat_interval: Duration,
    events: EventBus,
    accepted_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(
        max_connections: usize,
        protocol: ProtocolSettings,
        heartbeat_interval: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_connections,
            protocol,
            heartbeat_interval,
            events,
            accepted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Create from settings.
    pub fn from_settings(settings: &GatewaySettings, events: EventBus) -> Self {
        Self::new(
            settings.server.max_connections,
            settings.protocol.clone(),
            settings.connection.heartbeat_interval(),
            events,
        )
    }

    /// Protocol settings announced to clients.
    pub fn protocol(&self) -> &ProtocolSettings {
        &self.protocol
    }

    /// Heartbeat period announced to clients.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register a transport, queue the server `hello` and move to `HelloSent`.
    pub fn register(
        &self,
        address: SocketAddr,
        user_agent: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<Arc<Connection>, RegistryError> {
        let limit = self.max_connections;
        if self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_err()
        {
            let _ = self.rejected_total.fetch_add(1, Ordering::Relaxed);
            warn!(%address, limit, "connection refused: registry full");
            return Err(RegistryError::Full { limit });
        }

        let connection = Arc::new(Connection::new(ConnectionId::new(), address, user_agent, tx));
        let _ = self
            .connections
            .insert(connection.id.clone(), connection.clone());
        let _ = self.accepted_total.fetch_add(1, Ordering::Relaxed);

        let hello = ServerHello {
            version: self.protocol.version.clone(),
            supported_versions: self.protocol.supported_versions.clone(),
            capabilities: self.protocol.capabilities.clone(),
            connection_id: connection.id.to_string(),
            authenticated: false,
            user_id: None,
            heartbeat_interval_ms: u64::try_from(self.heartbeat_interval.as_millis()).unwrap_or(u64::MAX),
        };
        let frame = Message::outbound(
            MessageType::Hello,
            String::new(),
            serde_json::to_value(&hello).unwrap_or_default(),
        );
        let _ = connection.send_message(&frame);
        let _ = connection.transition(ConnectionState::Connecting, ConnectionState::HelloSent);

        info!(conn_id = %connection.id, %address, total = self.connections.len(), "connection registered");
        self.events.publish(GatewayEvent::Connected {
            connection_id: connection.id.to_string(),
            address: address.to_string(),
            at: Utc::now(),
        });
        Ok(connection)
    }

    /// Remove a connection. Returns it if it was registered.
    pub fn unregister(&self, id: &ConnectionId, reason: &str) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;
        let _ = self.reserved.fetch_sub(1, Ordering::AcqRel);
        connection.closed().cancel();
        info!(conn_id = %id, reason, remaining = self.connections.len(), "connection removed");
        self.events.publish(GatewayEvent::Disconnected {
            connection_id: id.to_string(),
            reason: reason.to_owned(),
        });
        Some(connection)
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Ask a connection to close. The transport task unregisters it.
    pub fn close(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        match self.get(id) {
            Some(connection) => {
                debug!(conn_id = %id, code, reason, "closing connection");
                connection.close(code, reason);
                true
            }
            None => false,
        }
    }

    /// Close every connection idle for longer than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let idle: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| c.idle_for() > timeout && c.state() != ConnectionState::Closing)
            .map(|c| c.clone())
            .collect();
        for connection in &idle {
            info!(conn_id = %connection.id, idle_ms = connection.idle_for().as_millis(), "closing idle connection");
            connection.close(CLOSE_NORMAL, "Connection timeout");
        }
        idle.into_iter().map(|c| c.id.clone()).collect()
    }

    /// Close every connection. Returns how many were asked to close.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let all: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.clone()).collect();
        for connection in &all {
            connection.close(code, reason);
        }
        all.len()
    }

    fn deliver<F>(&self, message: &Message, filter: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let frame = Arc::new(message.to_json());
        let mut delivered = 0;
        for entry in &self.connections {
            let connection = entry.value();
            if connection.is_active() && filter(connection.as_ref()) {
                if connection.send(frame.clone()) {
                    delivered += 1;
                } else {
                    warn!(conn_id = %connection.id, message_type = %message.message_type, "outbound queue full, frame dropped");
                }
            }
        }
        delivered
    }

    /// Send to every active connection bound to `session_id`.
    pub fn send_to_session(&self, session_id: &SessionId, message: &Message) -> usize {
        self.deliver(message, |c| c.session_id().as_ref() == Some(session_id))
    }

    /// Send to every active connection of `user_id`.
    pub fn send_to_user(&self, user_id: &UserId, message: &Message) -> usize {
        self.deliver(message, |c| c.user_id().as_ref() == Some(user_id))
    }

    /// Send to every active connection.
    pub fn broadcast_all(&self, message: &Message) -> usize {
        self.deliver(message, |_| true)
    }

    /// Deliver a lifecycle event to connections subscribed to its topic.
    ///
    /// With `owner` set, only that user's connections are considered.
    pub fn deliver_event(&self, event: &GatewayEvent, owner: Option<&UserId>) -> usize {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return 0;
            }
        };
        let message = Message::outbound(
            MessageType::from(event.event_type()),
            event.session_id().unwrap_or_default().to_owned(),
            payload,
        );
        let topic = event.topic();
        self.deliver(&message, |c| {
            c.is_subscribed(topic) && owner.is_none_or(|o| c.user_id().as_ref() == Some(o))
        })
    }

    /// Aggregate counts.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            max_connections: self.max_connections,
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            ..RegistryStats::default()
        };
        for entry in &self.connections {
            stats.total += 1;
            if entry.is_active() {
                stats.authenticated += 1;
            } else {
                stats.pending += 1;
            }
            stats.dropped_messages += entry.drop_count();
        }
        stats
    }

    /// Per-connection details.
    pub fn connection_stats(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.connections.iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    /// Registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
