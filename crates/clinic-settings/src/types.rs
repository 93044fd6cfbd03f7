//! Settings structs. Every section has a `Default` so partial sources
//! only need to name what they change.

use std::time::Duration;

use clinic_core::logging::LogFormat;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{Result, SettingsError};

/// Root settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Network listener.
    pub server: ServerSettings,
    /// Wire protocol.
    pub protocol: ProtocolSettings,
    /// Handshake credentials.
    pub auth: AuthSettings,
    /// Request budgets.
    pub rate_limit: RateLimitSettings,
    /// Session lifetime.
    pub session: SessionSettings,
    /// Connection liveness.
    pub connection: ConnectionSettings,
    /// Agent backend.
    pub agent: AgentSettings,
    /// Response cache.
    pub cache: CacheSettings,
    /// Chunked delivery.
    pub streaming: StreamingSettings,
    /// Metrics snapshots.
    pub metrics: MetricsSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject combinations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.expose_secret().is_empty() && !self.auth.allow_anonymous {
            return Err(SettingsError::InvalidValue(
                "auth.jwt_secret is required unless auth.allow_anonymous is set".into(),
            ));
        }
        if !self
            .protocol
            .supported_versions
            .contains(&self.protocol.version)
        {
            return Err(SettingsError::InvalidValue(format!(
                "protocol.version {} is not in protocol.supported_versions",
                self.protocol.version
            )));
        }
        if self.rate_limit.requests_per_minute == 0 && self.rate_limit.requests_per_hour == 0 {
            return Err(SettingsError::InvalidValue(
                "at least one of rate_limit.requests_per_minute / requests_per_hour must be > 0"
                    .into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.max_connections must be > 0".into(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(SettingsError::InvalidValue("session.ttl_secs must be > 0".into()));
        }
        if self.streaming.chunk_size == 0 {
            return Err(SettingsError::InvalidValue(
                "streaming.chunk_size must be > 0".into(),
            ));
        }
        if !self.agent.endpoint.starts_with("http://") && !self.agent.endpoint.starts_with("https://")
        {
            return Err(SettingsError::InvalidValue(format!(
                "agent.endpoint must be an http(s) URL, got {:?}",
                self.agent.endpoint
            )));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 = auto-assign).
    pub port: u16,
    /// Connections beyond this are closed with code 1008.
    pub max_connections: usize,
    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            max_connections: 100,
            max_message_size: 1024 * 1024,
            outbound_queue: 256,
        }
    }
}

/// Wire protocol settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Version announced in the server `hello`.
    pub version: String,
    /// Versions a client may ask for.
    pub supported_versions: Vec<String>,
    /// Capabilities the server offers.
    pub capabilities: Vec<String>,
    /// Largest tolerated clock skew of a frame timestamp, in seconds.
    pub max_message_age_secs: u64,
}

impl ProtocolSettings {
    /// Largest tolerated clock skew in milliseconds.
    pub fn max_message_age_ms(&self) -> u64 {
        self.max_message_age_secs.saturating_mul(1000)
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            supported_versions: vec!["1.0.0".to_string()],
            capabilities: vec![
                "query".to_string(),
                "streaming".to_string(),
                "feedback".to_string(),
                "session_update".to_string(),
                "context_update".to_string(),
                "subscriptions".to_string(),
                "cancel".to_string(),
            ],
            max_message_age_secs: 300,
        }
    }
}

/// Handshake credential settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 signing secret for client JWTs.
    #[serde(serialize_with = "serialize_redacted")]
    pub jwt_secret: SecretString,
    /// Expected `iss` claim, when set.
    pub jwt_issuer: Option<String>,
    /// Accept `hello` without a token (the connection id becomes the user id).
    pub allow_anonymous: bool,
    /// Pre-handshake offenses tolerated before the connection is closed.
    pub max_auth_failures: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: SecretString::new(String::new()),
            jwt_issuer: None,
            allow_anonymous: false,
            max_auth_failures: 3,
        }
    }
}

/// Request budget settings. A zero limit disables that window.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests per key per minute.
    pub requests_per_minute: u32,
    /// Requests per key per hour.
    pub requests_per_hour: u32,
    /// Buckets untouched for this long are swept.
    pub idle_bucket_ttl_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            idle_bucket_ttl_secs: 3600,
        }
    }
}

/// Session lifetime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Lifetime of a new session.
    pub ttl_secs: u64,
    /// Period of the expiry, idle-connection and bucket sweeps.
    pub cleanup_interval_secs: u64,
}

impl SessionSettings {
    /// Session lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60,
        }
    }
}

/// Connection liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Idle time after which a connection is closed.
    pub timeout_secs: u64,
    /// Transport ping period.
    pub heartbeat_interval_secs: u64,
}

impl ConnectionSettings {
    /// Idle timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Agent backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Base URL of the agent service.
    pub endpoint: String,
    /// Default query deadline.
    pub timeout_ms: u64,
    /// Deadline of `GET /health`.
    pub health_timeout_ms: u64,
    /// Consecutive failures that open the circuit.
    pub circuit_breaker_threshold: u32,
    /// How long the circuit stays open before a trial call.
    pub circuit_breaker_cooldown_secs: u64,
}

impl AgentSettings {
    /// Default query deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Health check deadline.
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Circuit cooldown.
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            timeout_ms: 30_000,
            health_timeout_ms: 2_000,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: 60,
        }
    }
}

/// Response cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Serve identical queries from cache.
    pub enabled: bool,
    /// Entry lifetime.
    pub ttl_secs: u64,
    /// Upper bound on stored entries.
    pub max_entries: usize,
    /// HMAC key for cache keys. A random key is generated when empty.
    #[serde(serialize_with = "serialize_redacted")]
    pub key_secret: SecretString,
}

impl CacheSettings {
    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 1000,
            key_secret: SecretString::new(String::new()),
        }
    }
}

/// Chunked delivery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Characters per chunk.
    pub chunk_size: usize,
    /// Pause between chunks.
    pub chunk_delay_ms: u64,
}

impl StreamingSettings {
    /// Pause between chunks.
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_delay_ms: 50,
        }
    }
}

/// Metrics snapshot settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Run the periodic snapshot task.
    pub enabled: bool,
    /// Snapshot period.
    pub interval_secs: u64,
}

impl MetricsSettings {
    /// Snapshot period.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Placeholder written in place of a configured secret.
const REDACTED: &str = "[REDACTED]";

/// Serialize a secret without revealing it. An unset secret stays empty so
/// the compiled defaults layer still means "not configured".
fn serialize_redacted<S: Serializer>(
    secret: &SecretString,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    if secret.expose_secret().is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str(REDACTED)
    }
}
