//! Dependency-injection context shared by every message handler.

use std::sync::Arc;
use std::time::Instant;

use clinic_settings::GatewaySettings;

use crate::connection::{Authenticator, ConnectionRegistry};
use crate::events::EventBus;
use crate::orchestrator::QueryOrchestrator;
use crate::rate_limit::RateLimiter;
use crate::session::{FeedbackSink, SessionStore};

/// Shared state handed to handlers. Built once at startup.
pub struct RouterContext {
    /// Effective settings.
    pub settings: Arc<GatewaySettings>,
    /// Live connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Session records.
    pub sessions: Arc<SessionStore>,
    /// Request budgets.
    pub rate_limiter: Arc<RateLimiter>,
    /// Hello verification.
    pub authenticator: Arc<Authenticator>,
    /// Query execution.
    pub orchestrator: Arc<QueryOrchestrator>,
    /// Feedback storage.
    pub feedback: Arc<dyn FeedbackSink>,
    /// Lifecycle event bus.
    pub events: EventBus,
    /// When the server started.
    pub start_time: Instant,
}
