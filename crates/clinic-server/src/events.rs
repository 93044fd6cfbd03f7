//! Lifecycle event bus and the bridge that fans events out to subscribed
//! connections.

use std::sync::Arc;

use clinic_core::events::GatewayEvent;
use clinic_core::ids::SessionId;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionRegistry;
use crate::session::SessionStore;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Typed publish/subscribe channel for [`GatewayEvent`]s.
///
/// Publishing never fails: with no subscriber the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event.
    pub fn publish(&self, event: GatewayEvent) {
        debug!(event_type = event.event_type(), "publish event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

/// Delivers bus events to connections subscribed to the event's topic.
///
/// Session-scoped events only reach connections of the session's owner.
pub struct EventBridge {
    rx: broadcast::Receiver<GatewayEvent>,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionStore>,
}

impl EventBridge {
    /// Create a bridge reading from `bus`.
    pub fn new(bus: &EventBus, registry: Arc<ConnectionRegistry>, sessions: Arc<SessionStore>) -> Self {
        Self {
            rx: bus.subscribe(),
            registry,
            sessions,
        }
    }

    /// Run until the bus closes or `cancel` fires.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                r = self.rx.recv() => r,
            };
            match received {
                Ok(event) => {
                    let owner = event
                        .session_id()
                        .and_then(SessionId::parse)
                        .and_then(|sid| self.sessions.owner_of(&sid));
                    if event.session_id().is_some() && owner.is_none() {
                        // session already gone; nobody may see it
                        continue;
                    }
                    let delivered = self.registry.deliver_event(&event, owner.as_ref());
                    if delivered > 0 {
                        debug!(event_type = event.event_type(), delivered, "event delivered");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event bus closed, bridge exiting");
                    break;
                }
            }
        }
    }
}
