//! Query orchestration.
//!
//! A `query` frame becomes a [`QueryRequest`] in the router and is handed to
//! [`QueryOrchestrator::submit`], which registers a cancellation token and
//! spawns the execution. Execution is cache-first, then a backend call
//! guarded by the circuit breaker and a deadline. The deadline and the
//! caller's token compose: whichever fires first ends the call, and nothing
//! is sent for a call that lost the race.
//!
//! Side effects after a successful answer (cache write, conversation
//! history, `user_message` / `assistant_response` events) never fail the
//! query.

pub mod backend;
pub mod cache;
pub mod circuit;
pub(crate) mod inflight;
#[cfg(test)]
pub(crate) mod mock;
pub mod stats;
pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use clinic_core::errors::{ErrorCode, GatewayError};
use clinic_core::events::GatewayEvent;
use clinic_core::ids::{ConnectionId, QueryId, UserId};
use clinic_core::message::{Message, MessageType};
use clinic_core::query::{QueryRequest, QueryResult};
use clinic_settings::GatewaySettings;
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::events::EventBus;
use crate::metrics::{
    BACKEND_CIRCUIT_OPEN, BACKEND_REQUESTS_TOTAL, CACHE_LOOKUPS_TOTAL, QUERIES_IN_FLIGHT,
    QUERIES_TOTAL, QUERY_DURATION_SECONDS,
};
use crate::session::{ConversationLog, ConversationTurn, Role};

pub use self::backend::{AgentBackend, BackendError, HttpAgentBackend};
pub use self::cache::{CacheKeyer, InMemoryQueryCache, QueryCache};
pub use self::circuit::{CircuitBreaker, CircuitStatus};
pub use self::inflight::AbortReason;
pub use self::stats::QueryStats;
pub use self::streaming::StreamOutcome;

use self::inflight::InFlightRegistry;
use self::stats::StatsRecorder;

/// Tunables of the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Deadline when the query does not carry `options.timeoutMs`.
    pub default_timeout: Duration,
    /// Serve and store answers in the cache.
    pub cache_enabled: bool,
    /// Lifetime of cache entries.
    pub cache_ttl: Duration,
    /// Characters per streaming chunk.
    pub chunk_size: usize,
    /// Pause between streaming chunks.
    pub chunk_delay: Duration,
    /// Consecutive backend failures that open the circuit.
    pub breaker_threshold: u32,
    /// How long the circuit stays open.
    pub breaker_cooldown: Duration,
}

impl OrchestratorConfig {
    /// Build from gateway settings.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            default_timeout: settings.agent.timeout(),
            cache_enabled: settings.cache.enabled,
            cache_ttl: settings.cache.ttl(),
            chunk_size: settings.streaming.chunk_size,
            chunk_delay: settings.streaming.chunk_delay(),
            breaker_threshold: settings.agent.circuit_breaker_threshold,
            breaker_cooldown: settings.agent.circuit_breaker_cooldown(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&GatewaySettings::default())
    }
}

/// How an execution ended before any frame was sent.
enum Failure {
    Aborted,
    Error(GatewayError),
}

/// Executes queries against the agent backend.
pub struct QueryOrchestrator {
    backend: Arc<dyn AgentBackend>,
    cache: Arc<dyn QueryCache>,
    keyer: CacheKeyer,
    history: Arc<dyn ConversationLog>,
    events: EventBus,
    breaker: CircuitBreaker,
    inflight: InFlightRegistry,
    stats: StatsRecorder,
    config: OrchestratorConfig,
}

impl QueryOrchestrator {
    /// Assemble an orchestrator.
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        cache: Arc<dyn QueryCache>,
        history: Arc<dyn ConversationLog>,
        events: EventBus,
        keyer: CacheKeyer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            keyer,
            history,
            events,
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown),
            inflight: InFlightRegistry::default(),
            stats: StatsRecorder::default(),
            config,
        }
    }

    /// Accept `query` for execution and return immediately.
    ///
    /// Replies (`response`, `streaming_*`, `error` or an `aborted` status)
    /// are sent to `connection` as answers to `request`. Fails only when a
    /// query with the same id from the same user is already in flight.
    pub fn submit(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        request: Message,
        query: QueryRequest,
    ) -> Result<(), GatewayError> {
        let Some(token) =
            self.inflight
                .insert(&query.user_id, &query.query_id, connection.id.clone())
        else {
            return Err(GatewayError::InvalidMessage(format!(
                "query {} is already in progress",
                query.query_id
            )));
        };
        self.stats.started();
        self.refresh_in_flight_gauge();
        self.events.publish(GatewayEvent::QueryStarted {
            query_id: query.query_id.to_string(),
            session_id: query.session_id.to_string(),
        });

        let this = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            this.run(connection, request, query, token).await;
        });
        Ok(())
    }

    #[instrument(skip_all, fields(query_id = %query.query_id, session_id = %query.session_id))]
    async fn run(
        self: Arc<Self>,
        connection: Arc<Connection>,
        request: Message,
        query: QueryRequest,
        token: CancellationToken,
    ) {
        let started = Instant::now();
        match self.execute(&query, &token).await {
            Ok(mut result) => {
                result.processing_time_ms = elapsed_ms(started);
                self.record_conversation(&query, &result).await;
                let delivered = if query.options.streaming {
                    streaming::deliver_chunks(
                        &connection,
                        &request,
                        &result,
                        self.config.chunk_size,
                        self.config.chunk_delay,
                        &token,
                    )
                    .await
                        == StreamOutcome::Completed
                } else {
                    let _ = connection.send_message(&response_frame(&request, &result));
                    true
                };
                if delivered {
                    self.finish_completed(&query, &result, started);
                } else {
                    self.finish_aborted(&connection, &request, &query);
                }
            }
            Err(Failure::Aborted) => self.finish_aborted(&connection, &request, &query),
            Err(Failure::Error(err)) => {
                let timed_out = err.code() == ErrorCode::Timeout;
                warn!(code = %err.code(), error = %err, "query failed");
                let _ = connection.send_message(&Message::error(
                    &err,
                    Some(request.id.as_str()),
                    &request.session_id,
                ));
                self.stats.failed(timed_out);
                counter!(QUERIES_TOTAL, "outcome" => if timed_out { "timeout" } else { "failed" })
                    .increment(1);
                self.events.publish(GatewayEvent::QueryFailed {
                    query_id: query.query_id.to_string(),
                    session_id: query.session_id.to_string(),
                    code: err.code(),
                });
            }
        }
        self.inflight.remove(&query.user_id, &query.query_id);
        self.refresh_in_flight_gauge();
    }

    /// Cache lookup, then a guarded backend call.
    async fn execute(
        &self,
        query: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, Failure> {
        let key = self.config.cache_enabled.then(|| self.keyer.key(query));

        if let Some(key) = key.as_deref().filter(|_| !query.options.bypass_cache) {
            match self.cache.get(key).await {
                Ok(Some(mut hit)) => {
                    self.stats.cache_hit();
                    counter!(CACHE_LOOKUPS_TOTAL, "result" => "hit").increment(1);
                    debug!("served from cache");
                    hit.cached = true;
                    return Ok(hit);
                }
                Ok(None) => {
                    self.stats.cache_miss();
                    counter!(CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
                }
                Err(e) => {
                    self.stats.cache_miss();
                    counter!(CACHE_LOOKUPS_TOTAL, "result" => "error").increment(1);
                    warn!(error = %e, "cache lookup failed, falling through to backend");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Failure::Aborted);
        }
        if !self.breaker.try_acquire() {
            counter!(BACKEND_REQUESTS_TOTAL, "outcome" => "rejected").increment(1);
            return Err(Failure::Error(GatewayError::AiService(
                "agent service temporarily unavailable".into(),
            )));
        }

        let timeout = query
            .options
            .timeout_ms
            .map_or(self.config.default_timeout, Duration::from_millis);
        let call_token = cancel.child_token();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.breaker.release_trial();
                counter!(BACKEND_REQUESTS_TOTAL, "outcome" => "aborted").increment(1);
                return Err(Failure::Aborted);
            }
            () = tokio::time::sleep(timeout) => {
                call_token.cancel();
                self.breaker.record_failure();
                self.refresh_circuit_gauge();
                counter!(BACKEND_REQUESTS_TOTAL, "outcome" => "timeout").increment(1);
                return Err(Failure::Error(GatewayError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }));
            }
            r = self.backend.query(query, &call_token) => r,
        };

        match outcome {
            Ok(mut result) => {
                self.breaker.record_success();
                self.refresh_circuit_gauge();
                counter!(BACKEND_REQUESTS_TOTAL, "outcome" => "ok").increment(1);
                result.cached = false;
                if let Some(key) = key.as_deref() {
                    if let Err(e) = self.cache.put(key, &result, self.config.cache_ttl).await {
                        warn!(error = %e, "cache write failed");
                    }
                }
                Ok(result)
            }
            Err(BackendError::Cancelled) => {
                self.breaker.release_trial();
                Err(Failure::Aborted)
            }
            Err(e) => {
                self.breaker.record_failure();
                self.refresh_circuit_gauge();
                counter!(BACKEND_REQUESTS_TOTAL, "outcome" => "error").increment(1);
                warn!(error = %e, circuit = self.breaker.state_name(), "agent backend call failed");
                Err(Failure::Error(GatewayError::AiService(e.client_message())))
            }
        }
    }

    /// Append the exchange to the conversation and announce it.
    async fn record_conversation(&self, query: &QueryRequest, result: &QueryResult) {
        let turns = [
            ConversationTurn::new(Role::User, query.query.clone(), query.query_id.as_str()),
            ConversationTurn::new(
                Role::Assistant,
                result.content.clone(),
                query.query_id.as_str(),
            ),
        ];
        for turn in turns {
            if let Err(e) = self.history.append(&query.session_id, turn).await {
                warn!(error = %e, "failed to record conversation turn");
            }
        }
        self.events.publish(GatewayEvent::UserMessage {
            session_id: query.session_id.to_string(),
            user_id: query.user_id.to_string(),
            content: query.query.clone(),
        });
        self.events.publish(GatewayEvent::AssistantResponse {
            session_id: query.session_id.to_string(),
            query_id: query.query_id.to_string(),
            content: result.content.clone(),
        });
    }

    fn finish_completed(&self, query: &QueryRequest, result: &QueryResult, started: Instant) {
        self.stats.completed(result.processing_time_ms);
        counter!(QUERIES_TOTAL, "outcome" => "completed").increment(1);
        histogram!(QUERY_DURATION_SECONDS, "cached" => if result.cached { "true" } else { "false" })
            .record(started.elapsed().as_secs_f64());
        info!(
            cached = result.cached,
            processing_time_ms = result.processing_time_ms,
            "query completed"
        );
        self.events.publish(GatewayEvent::QueryCompleted {
            query_id: query.query_id.to_string(),
            session_id: query.session_id.to_string(),
            cached: result.cached,
            processing_time_ms: result.processing_time_ms,
        });
    }

    fn finish_aborted(&self, connection: &Connection, request: &Message, query: &QueryRequest) {
        let reason = self
            .inflight
            .abort_reason(&query.user_id, &query.query_id)
            .unwrap_or(AbortReason::Cancelled);
        info!(reason = reason.as_str(), "query aborted");
        if reason != AbortReason::Disconnected {
            let _ = connection.send_message(&Message::reply_to(
                request,
                MessageType::Status,
                json!({
                    "state": "aborted",
                    "queryId": query.query_id.as_str(),
                    "reason": reason.as_str(),
                }),
            ));
        }
        self.stats.aborted();
        counter!(QUERIES_TOTAL, "outcome" => "aborted").increment(1);
        self.events.publish(GatewayEvent::QueryAborted {
            query_id: query.query_id.to_string(),
            session_id: query.session_id.to_string(),
            reason: reason.as_str().to_owned(),
        });
    }

    /// Cancel a query owned by `owner`. Returns `false` when no such query
    /// is in flight.
    pub fn cancel(&self, query_id: &QueryId, owner: &UserId) -> bool {
        self.inflight.cancel(owner, query_id, AbortReason::Cancelled)
    }

    /// Cancel every query started from a connection that went away.
    pub fn cancel_for_connection(&self, connection_id: &ConnectionId) -> usize {
        let n = self
            .inflight
            .cancel_for_connection(connection_id, AbortReason::Disconnected);
        if n > 0 {
            debug!(conn_id = %connection_id, count = n, "cancelled queries of closed connection");
        }
        n
    }

    /// Cancel everything in flight.
    pub fn cancel_all(&self, reason: AbortReason) -> usize {
        self.inflight.cancel_all(reason)
    }

    /// Wait until no query is in flight, up to `timeout`. Returns whether
    /// the orchestrator drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.inflight.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Check the backend health endpoint.
    pub async fn backend_health(&self) -> Result<(), BackendError> {
        self.backend.health().await
    }

    /// Circuit breaker state.
    pub fn circuit_status(&self) -> CircuitStatus {
        self.breaker.status()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueryStats {
        self.stats.snapshot(self.inflight.len())
    }

    /// Queries currently executing.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    #[allow(clippy::cast_precision_loss)]
    fn refresh_in_flight_gauge(&self) {
        gauge!(QUERIES_IN_FLIGHT).set(self.inflight.len() as f64);
    }

    fn refresh_circuit_gauge(&self) {
        let open = self.breaker.status() != CircuitStatus::Closed;
        gauge!(BACKEND_CIRCUIT_OPEN).set(if open { 1.0 } else { 0.0 });
    }
}

fn response_frame(request: &Message, result: &QueryResult) -> Message {
    let mut payload = serde_json::to_value(result).unwrap_or_default();
    if let Some(obj) = payload.as_object_mut() {
        let _ = obj.insert("queryId".into(), json!(request.id));
    }
    Message::reply_to(request, MessageType::Response, payload)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
