//! Gateway assembly and the axum HTTP + WebSocket surface.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use clinic_settings::GatewaySettings;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::connection::{Authenticator, CLOSE_GOING_AWAY, ConnectionRegistry};
use crate::events::{EventBridge, EventBus};
use crate::health::HealthAggregator;
use crate::metrics::{SESSIONS_EXPIRED_TOTAL, render};
use crate::orchestrator::{
    AbortReason, AgentBackend, BackendError, CacheKeyer, HttpAgentBackend, InMemoryQueryCache,
    OrchestratorConfig, QueryOrchestrator,
};
use crate::rate_limit::RateLimiter;
use crate::router::{MessageRouter, RouterContext, builtin_handlers};
use crate::session::history::DEFAULT_HISTORY_LIMIT;
use crate::session::{InMemoryConversationLog, InMemoryFeedbackSink, SessionStore};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::run_ws_session;

/// Period of the rate-limit bucket sweep.
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state of the axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Frame router (and through it, every component).
    pub router: Arc<MessageRouter>,
    /// Health snapshots.
    pub health: Arc<HealthAggregator>,
    /// Prometheus exposition, when a recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
    /// Shutdown signal.
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Every gateway component, wired from settings and not yet serving.
pub struct Gateway {
    settings: Arc<GatewaySettings>,
    router: Arc<MessageRouter>,
    health: Arc<HealthAggregator>,
    cache: Arc<InMemoryQueryCache>,
    prometheus: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Gateway {
    /// Wire a gateway talking to the HTTP agent service in `settings.agent`.
    pub fn new(settings: GatewaySettings) -> Result<Self, BackendError> {
        let backend = HttpAgentBackend::new(settings.agent.endpoint.clone(), settings.agent.health_timeout())?;
        Ok(Self::with_backend(settings, Arc::new(backend)))
    }

    /// Wire a gateway around an explicit agent backend.
    pub fn with_backend(settings: GatewaySettings, backend: Arc<dyn AgentBackend>) -> Self {
        let events = EventBus::default();
        let cache = Arc::new(InMemoryQueryCache::new(settings.cache.max_entries));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            backend,
            cache.clone(),
            Arc::new(InMemoryConversationLog::new(DEFAULT_HISTORY_LIMIT)),
            events.clone(),
            CacheKeyer::from_config(&settings.cache.key_secret),
            OrchestratorConfig::from_settings(&settings),
        ));
        let ctx = Arc::new(RouterContext {
            connections: Arc::new(ConnectionRegistry::from_settings(&settings, events.clone())),
            sessions: Arc::new(SessionStore::new(settings.session.ttl(), events.clone())),
            rate_limiter: Arc::new(RateLimiter::from_settings(&settings.rate_limit)),
            authenticator: Arc::new(Authenticator::from_settings(&settings.auth)),
            orchestrator,
            feedback: Arc::new(InMemoryFeedbackSink::default()),
            events,
            start_time: Instant::now(),
            settings: Arc::new(settings),
        });
        let router = Arc::new(MessageRouter::new(ctx.clone(), builtin_handlers()));
        Self {
            settings: ctx.settings.clone(),
            health: Arc::new(HealthAggregator::new(router.clone())),
            router,
            cache,
            prometheus: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Expose `handle` at `/metrics`.
    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Frame router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Health aggregator.
    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The axum application: `/ws`, `/health` and `/metrics`.
    pub fn app(&self) -> Router {
        let state = AppState {
            router: self.router.clone(),
            health: self.health.clone(),
            prometheus: self.prometheus.clone(),
            shutdown: self.shutdown.clone(),
        };
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the housekeeping tasks under the shutdown coordinator.
    pub fn spawn_background(&self) {
        let ctx = self.router.context().clone();
        let token = self.shutdown.token();

        let bridge = EventBridge::new(&ctx.events, ctx.connections.clone(), ctx.sessions.clone());
        self.shutdown.spawn("event_bridge", bridge.run(token.clone()));

        let sessions = ctx.sessions.clone();
        self.shutdown.spawn(
            "session_sweeper",
            every(self.settings.session.cleanup_interval(), token.clone(), move || {
                let expired = sessions.sweep_expired().len();
                if expired > 0 {
                    counter!(SESSIONS_EXPIRED_TOTAL).increment(u64::try_from(expired).unwrap_or(u64::MAX));
                }
            }),
        );

        let connections = ctx.connections.clone();
        let idle_timeout = self.settings.connection.timeout();
        self.shutdown.spawn(
            "idle_sweeper",
            every(self.settings.connection.heartbeat_interval(), token.clone(), move || {
                let _ = connections.sweep_idle(idle_timeout);
            }),
        );

        let limiter = ctx.rate_limiter.clone();
        self.shutdown.spawn(
            "rate_limit_sweeper",
            every(RATE_LIMIT_SWEEP_INTERVAL, token.clone(), move || {
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "rate-limit buckets swept");
                }
            }),
        );

        if self.settings.cache.enabled {
            let cache = self.cache.clone();
            self.shutdown.spawn(
                "cache_purger",
                every(self.settings.session.cleanup_interval(), token.clone(), move || {
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        debug!(purged, "expired cache entries purged");
                    }
                }),
            );
        }

        if self.settings.metrics.enabled {
            self.shutdown.spawn(
                "stats_reporter",
                self.health.clone().run_reporter(self.settings.metrics.interval(), token),
            );
        }
    }

    /// Bind `server.host:server.port`, start the background tasks and serve.
    pub async fn serve(self) -> io::Result<ServerHandle> {
        let listener =
            TcpListener::bind((self.settings.server.host.as_str(), self.settings.server.port)).await?;
        let addr = listener.local_addr()?;
        self.spawn_background();

        let app = self.app();
        let token = self.shutdown.token();
        let serve = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
        info!(%addr, "gateway listening");

        Ok(ServerHandle {
            addr,
            router: self.router,
            shutdown: self.shutdown,
            serve,
        })
    }
}

/// Run `tick` every `period` until `cancel` fires. The first run happens
/// one period after start.
fn every<F>(period: Duration, cancel: CancellationToken, mut tick: F) -> impl Future<Output = ()> + Send + 'static
where
    F: FnMut() + Send + 'static,
{
    async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => tick(),
            }
        }
    }
}

/// A running gateway.
pub struct ServerHandle {
    addr: SocketAddr,
    router: Arc<MessageRouter>,
    shutdown: Arc<ShutdownCoordinator>,
    serve: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Frame router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Stop accepting, abort in-flight queries, close every socket with
    /// 1001 and join the background tasks. `grace` bounds each waiting step.
    pub async fn shutdown(self, grace: Duration) -> io::Result<()> {
        let ctx = self.router.context().clone();
        info!("gateway shutting down");
        self.shutdown.shutdown();

        let aborted = ctx.orchestrator.cancel_all(AbortReason::Shutdown);
        if !ctx.orchestrator.drain(grace).await {
            warn!(in_flight = ctx.orchestrator.in_flight(), "queries still running at shutdown");
        }
        let closing = ctx.connections.close_all(CLOSE_GOING_AWAY, "Server shutting down");
        info!(aborted, closing, "clients notified");

        let deadline = tokio::time::Instant::now() + grace;
        while !ctx.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = self.shutdown.graceful_shutdown(Some(grace)).await;
        match tokio::time::timeout(grace, self.serve).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => {
                warn!("http server did not stop within {grace:?}");
                Ok(())
            }
        }
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(address): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let max_size = state.router.context().settings.server.max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| run_ws_session(socket, address, user_agent, state.router))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.health.check().await;
    (snapshot.status.http_status(), Json(snapshot)).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
