//! `/health` snapshot and the periodic stats reporter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use metrics::gauge;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::RegistryStats;
use crate::metrics::{RATE_LIMIT_KEYS, SESSIONS_ACTIVE, WS_CONNECTIONS_ACTIVE};
use crate::orchestrator::{CircuitStatus, QueryStats};
use crate::router::{MessageRouter, RouterStats};

/// Overall verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything answers.
    Ok,
    /// The backend check failed but the circuit still lets calls through.
    Degraded,
    /// The circuit is open and the backend does not answer.
    Unhealthy,
}

impl HealthStatus {
    /// HTTP status for `/health`.
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::Ok | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Agent backend view.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    /// Circuit breaker state.
    pub circuit: CircuitStatus,
    /// Check result; `None` when no check ran.
    pub reachable: Option<bool>,
}

/// Body of `/health`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Gateway version.
    pub version: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Connection counts.
    pub connections: RegistryStats,
    /// Sessions not yet expired.
    pub active_sessions: usize,
    /// Query counters.
    pub queries: QueryStats,
    /// Router counters.
    pub messages: RouterStats,
    /// Tracked rate-limit keys.
    pub rate_limit_keys: usize,
    /// Agent backend state.
    pub backend: BackendHealth,
}

/// Combine breaker state and backend check result.
pub fn classify(circuit: CircuitStatus, reachable: Option<bool>) -> HealthStatus {
    match (circuit, reachable) {
        (CircuitStatus::Closed, Some(false)) => HealthStatus::Degraded,
        (CircuitStatus::Open | CircuitStatus::HalfOpen, Some(false)) => HealthStatus::Unhealthy,
        (CircuitStatus::Open, None) => HealthStatus::Degraded,
        _ => HealthStatus::Ok,
    }
}

/// Builds health snapshots from the live components.
pub struct HealthAggregator {
    router: Arc<MessageRouter>,
}

impl HealthAggregator {
    /// Aggregator over everything reachable from `router`.
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }

    /// Snapshot without touching the backend.
    pub fn snapshot(&self) -> HealthResponse {
        self.build(None)
    }

    /// Snapshot including a backend health check.
    pub async fn check(&self) -> HealthResponse {
        let reachable = match self.router.context().orchestrator.backend_health().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "backend health check failed");
                false
            }
        };
        self.build(Some(reachable))
    }

    fn build(&self, reachable: Option<bool>) -> HealthResponse {
        let ctx = self.router.context();
        let circuit = ctx.orchestrator.circuit_status();
        HealthResponse {
            status: classify(circuit, reachable),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: ctx.start_time.elapsed().as_secs(),
            connections: ctx.connections.stats(),
            active_sessions: ctx.sessions.active_count(),
            queries: ctx.orchestrator.stats(),
            messages: self.router.stats(),
            rate_limit_keys: ctx.rate_limiter.len(),
            backend: BackendHealth { circuit, reachable },
        }
    }

    /// Log a snapshot and refresh the gauges it covers.
    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self) -> HealthResponse {
        let snapshot = self.snapshot();
        gauge!(WS_CONNECTIONS_ACTIVE).set(snapshot.connections.total as f64);
        gauge!(SESSIONS_ACTIVE).set(snapshot.active_sessions as f64);
        gauge!(RATE_LIMIT_KEYS).set(snapshot.rate_limit_keys as f64);
        info!(
            connections = snapshot.connections.total,
            authenticated = snapshot.connections.authenticated,
            sessions = snapshot.active_sessions,
            queries_total = snapshot.queries.total,
            queries_in_flight = snapshot.queries.in_flight,
            cache_hits = snapshot.queries.cache_hits,
            avg_processing_ms = snapshot.queries.avg_processing_time_ms,
            messages = snapshot.messages.received,
            circuit = ?snapshot.backend.circuit,
            "gateway stats"
        );
        snapshot
    }

    /// Report every `interval` until `cancel` fires.
    pub async fn run_reporter(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let _ = ticker.tick().await;
        let started = Instant::now();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.report();
                }
            }
        }
        info!(ran_secs = started.elapsed().as_secs(), "stats reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::testing::Harness;

    fn aggregator(h: Harness) -> HealthAggregator {
        HealthAggregator::new(Arc::new(h.router))
    }

    #[test]
    fn only_open_circuit_with_dead_backend_is_unhealthy() {
        assert_eq!(classify(CircuitStatus::Closed, Some(true)), HealthStatus::Ok);
        assert_eq!(classify(CircuitStatus::Closed, None), HealthStatus::Ok);
        assert_eq!(classify(CircuitStatus::Closed, Some(false)), HealthStatus::Degraded);
        assert_eq!(classify(CircuitStatus::Open, Some(true)), HealthStatus::Ok);
        assert_eq!(classify(CircuitStatus::Open, Some(false)), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Unhealthy.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(HealthStatus::Degraded.http_status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn check_queries_the_backend() {
        let agg = aggregator(Harness::new());
        let health = agg.check().await;
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.backend.reachable, Some(true));
        assert_eq!(health.backend.circuit, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn failed_check_with_closed_circuit_degrades() {
        let h = Harness::new();
        h.backend.set_failing(true);
        let health = aggregator(h).check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.backend.reachable, Some(false));
    }

    #[tokio::test]
    async fn snapshot_counts_connections_and_sessions() {
        let h = Harness::new();
        let (_conn, _rx) = h.authenticated("u1").await;
        let _ = h.ctx.sessions.get_or_create(&Harness::sid(), &"u1".into());
        let agg = aggregator(h);

        let snap = agg.report();
        assert_eq!(snap.connections.total, 1);
        assert_eq!(snap.connections.authenticated, 1);
        assert_eq!(snap.active_sessions, 1);
        assert!(snap.messages.received >= 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["uptimeSecs"].is_number());
        assert!(json["backend"]["reachable"].is_null());
    }
}
