//! In-process router fixture for unit tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clinic_core::ids::SessionId;
use clinic_settings::GatewaySettings;
use jsonwebtoken::{EncodingKey, Header, encode};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::context::RouterContext;
use super::handlers::builtin_handlers;
use super::pipeline::MessageRouter;
use crate::connection::{Authenticator, Claims, Connection, ConnectionRegistry, Outbound};
use crate::events::EventBus;
use crate::orchestrator::mock::MockBackend;
use crate::orchestrator::{CacheKeyer, InMemoryQueryCache, OrchestratorConfig, QueryOrchestrator};
use crate::rate_limit::RateLimiter;
use crate::session::{InMemoryConversationLog, InMemoryFeedbackSink, SessionStore};

const SECRET: &str = "router-test-secret";

pub(crate) struct Harness {
    pub(crate) ctx: Arc<RouterContext>,
    pub(crate) router: MessageRouter,
    pub(crate) feedback: Arc<InMemoryFeedbackSink>,
    pub(crate) backend: Arc<MockBackend>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub(crate) fn with_settings(customize: impl FnOnce(&mut GatewaySettings)) -> Self {
        let mut settings = GatewaySettings::default();
        settings.auth.jwt_secret = SecretString::new(SECRET.into());
        customize(&mut settings);

        let events = EventBus::default();
        let backend = Arc::new(MockBackend::new("Temos horários às 14h."));
        let feedback = Arc::new(InMemoryFeedbackSink::default());
        let orchestrator = Arc::new(QueryOrchestrator::new(
            backend.clone(),
            Arc::new(InMemoryQueryCache::new(100)),
            Arc::new(InMemoryConversationLog::default()),
            events.clone(),
            CacheKeyer::new(SecretString::new("cache-secret".into())),
            OrchestratorConfig::from_settings(&settings),
        ));
        let ctx = Arc::new(RouterContext {
            connections: Arc::new(ConnectionRegistry::from_settings(&settings, events.clone())),
            sessions: Arc::new(SessionStore::new(settings.session.ttl(), events.clone())),
            rate_limiter: Arc::new(RateLimiter::from_settings(&settings.rate_limit)),
            authenticator: Arc::new(Authenticator::from_settings(&settings.auth)),
            orchestrator,
            feedback: feedback.clone(),
            events,
            start_time: Instant::now(),
            settings: Arc::new(settings),
        });
        let router = MessageRouter::new(Arc::clone(&ctx), builtin_handlers());
        Self {
            ctx,
            router,
            feedback,
            backend,
        }
    }

    /// Register a connection and swallow the server hello.
    pub(crate) fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, mut rx) = mpsc::channel(256);
        let conn = self
            .ctx
            .connections
            .register("127.0.0.1:40000".parse().unwrap(), Some("test".into()), tx)
            .unwrap();
        match rx.try_recv() {
            Ok(Outbound::Frame(_)) => {}
            other => panic!("expected server hello, got {other:?}"),
        }
        (conn, rx)
    }

    pub(crate) async fn authenticated(&self, user: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, mut rx) = self.connect();
        let raw = Self::frame("hello", "hello-1", json!({ "token": Self::token(user) }));
        self.router.handle(&conn.id, raw.as_bytes()).await;
        let hello = Self::next(&mut rx).await;
        assert_eq!(hello["payload"]["authenticated"], true, "{hello}");
        (conn, rx)
    }

    pub(crate) fn token(sub: &str) -> String {
        let exp = u64::try_from(Utc::now().timestamp()).unwrap() + 3600;
        let claims = Claims {
            sub: sub.into(),
            exp,
            iss: None,
            capabilities: None,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    pub(crate) fn sid() -> SessionId {
        SessionId::parse("abc12345").unwrap()
    }

    pub(crate) fn frame(kind: &str, id: &str, payload: Value) -> String {
        Self::frame_at(kind, id, payload, Utc::now())
    }

    pub(crate) fn frame_at(kind: &str, id: &str, payload: Value, at: DateTime<Utc>) -> String {
        json!({
            "id": id,
            "type": kind,
            "timestamp": at.to_rfc3339(),
            "sessionId": "abc12345",
            "payload": payload,
        })
        .to_string()
    }

    pub(crate) async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Frame(f))) => serde_json::from_str(&f).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    pub(crate) async fn next_close(rx: &mut mpsc::Receiver<Outbound>) -> u16 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Close { code, .. })) => code,
            other => panic!("expected a close, got {other:?}"),
        }
    }
}
