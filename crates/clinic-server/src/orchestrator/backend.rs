//! Agent backend client.

use std::time::Duration;

use async_trait::async_trait;
use clinic_core::query::{BackendQuery, QueryRequest, QueryResult};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Path of the query endpoint, relative to the configured agent endpoint.
pub const QUERY_PATH: &str = "/api/ai/data-agent";
/// Path of the health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Agent backend failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport failure (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status.
    #[error("agent returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        message: String,
    },

    /// Body could not be read as a result.
    #[error("invalid agent response: {0}")]
    InvalidResponse(String),

    /// The caller's token fired before the call completed.
    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    /// Sentence safe to forward to clients.
    pub fn client_message(&self) -> String {
        match self {
            Self::Http(e) if e.is_timeout() => "agent service did not respond in time".to_owned(),
            Self::Http(_) => "agent service unreachable".to_owned(),
            Self::Status { status, .. } => format!("agent service returned status {status}"),
            Self::InvalidResponse(_) => "agent service returned an invalid response".to_owned(),
            Self::Cancelled => "request cancelled".to_owned(),
        }
    }
}

/// Downstream agent that answers queries.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Answer `request`. Must stop promptly once `cancel` fires.
    async fn query(&self, request: &QueryRequest, cancel: &CancellationToken) -> Result<QueryResult, BackendError>;

    /// Liveness check.
    async fn health(&self) -> Result<(), BackendError>;
}

/// HTTP client for the agent service.
pub struct HttpAgentBackend {
    client: reqwest::Client,
    endpoint: String,
    health_timeout: Duration,
}

const MAX_ERROR_BODY: usize = 512;

impl HttpAgentBackend {
    /// Client for `endpoint` (scheme + host, no trailing path).
    pub fn new(endpoint: impl Into<String>, health_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("clinic-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            health_timeout,
        })
    }

    /// Configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_query(&self, request: &QueryRequest) -> Result<QueryResult, BackendError> {
        let url = format!("{}{QUERY_PATH}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&BackendQuery::from_request(request))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        let body: serde_json::Value = response.json().await?;
        serde_json::from_value(body).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

fn status_error(status: StatusCode, mut body: String) -> BackendError {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    BackendError::Status {
        status: status.as_u16(),
        message: body,
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    #[instrument(skip_all, fields(query_id = %request.query_id, session_id = %request.session_id))]
    async fn query(&self, request: &QueryRequest, cancel: &CancellationToken) -> Result<QueryResult, BackendError> {
        debug!(endpoint = %self.endpoint, "calling agent backend");
        tokio::select! {
            () = cancel.cancelled() => Err(BackendError::Cancelled),
            result = self.send_query(request) => result,
        }
    }

    async fn health(&self) -> Result<(), BackendError> {
        let url = format!("{}{HEALTH_PATH}", self.endpoint);
        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, response.text().await.unwrap_or_default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use clinic_core::ids::{QueryId, SessionId, UserId};
    use clinic_core::query::ResultKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> QueryRequest {
        QueryRequest {
            query_id: QueryId::from("q-1"),
            session_id: SessionId::parse("abc12345").unwrap(),
            user_id: UserId::from("dr-ana"),
            query: "quantos pacientes hoje?".into(),
            context: clinic_core::QueryContext::default(),
            options: clinic_core::QueryOptions::default(),
        }
    }

    #[tokio::test]
    async fn posts_query_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .and(body_partial_json(json!({
                "query": "quantos pacientes hoje?",
                "session_id": "abc12345",
                "user_id": "dr-ana",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query_id": "x",
                "response": "12 pacientes",
                "context_used": {},
                "session_updated": true,
                "timestamp": "2026-10-17T12:00:00Z",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpAgentBackend::new(server.uri(), Duration::from_secs(1)).unwrap();
        let result = backend.query(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(result.content, "12 pacientes");
        assert_eq!(result.kind, ResultKind::Text);
        assert!(!result.cached);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;
        let backend = HttpAgentBackend::new(server.uri(), Duration::from_secs(1)).unwrap();
        let err = backend.query(&request(), &CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, BackendError::Status { status: 502, .. });
        assert_eq!(err.client_message(), "agent service returned status 502");
    }

    #[tokio::test]
    async fn body_without_content_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        let backend = HttpAgentBackend::new(server.uri(), Duration::from_secs(1)).unwrap();
        assert_matches!(
            backend.query(&request(), &CancellationToken::new()).await,
            Err(BackendError::InvalidResponse(_))
        );
    }

    #[tokio::test]
    async fn cancellation_stops_pending_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "late"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let backend = HttpAgentBackend::new(server.uri(), Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        assert_matches!(backend.query(&request(), &cancel).await, Err(BackendError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn health_check_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_PATH))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let backend = HttpAgentBackend::new(format!("{}/", server.uri()), Duration::from_secs(1)).unwrap();
        assert!(backend.health().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;
        let backend = HttpAgentBackend::new(server.uri(), Duration::from_millis(100)).unwrap();
        assert_matches!(backend.health().await, Err(BackendError::Http(_)));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, "é".repeat(600));
        match err {
            BackendError::Status { message, .. } => assert!(message.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected {other:?}"),
        }
    }
}
