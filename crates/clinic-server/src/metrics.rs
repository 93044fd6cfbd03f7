//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup, before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Inbound frames (counter, labels: type, outcome).
pub const MESSAGES_TOTAL: &str = "clinic_messages_total";
/// Router processing time (histogram, labels: type).
pub const MESSAGE_DURATION_SECONDS: &str = "clinic_message_duration_seconds";
/// Error frames sent (counter, labels: code).
pub const ERRORS_TOTAL: &str = "clinic_errors_total";
/// Requests refused by the rate limiter (counter, labels: window).
pub const RATE_LIMITED_TOTAL: &str = "clinic_rate_limited_total";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections refused at capacity (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Handshake failures (counter, labels: reason).
pub const AUTH_FAILURES_TOTAL: &str = "clinic_auth_failures_total";
/// Queries by final outcome (counter, labels: outcome).
pub const QUERIES_TOTAL: &str = "clinic_queries_total";
/// Query processing time (histogram, labels: cached).
pub const QUERY_DURATION_SECONDS: &str = "clinic_query_duration_seconds";
/// Cache lookups (counter, labels: result).
pub const CACHE_LOOKUPS_TOTAL: &str = "clinic_cache_lookups_total";
/// Queries in flight (gauge).
pub const QUERIES_IN_FLIGHT: &str = "clinic_queries_in_flight";
/// Backend calls (counter, labels: outcome).
pub const BACKEND_REQUESTS_TOTAL: &str = "clinic_backend_requests_total";
/// Circuit breaker open (gauge, 1 = open or half-open).
pub const BACKEND_CIRCUIT_OPEN: &str = "clinic_backend_circuit_open";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "clinic_sessions_active";
/// Sessions removed by the expiry sweep (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "clinic_sessions_expired_total";
/// Tracked rate-limit keys (gauge).
pub const RATE_LIMIT_KEYS: &str = "clinic_rate_limit_keys";
