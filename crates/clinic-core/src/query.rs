//! Query request/result types exchanged between the router, the
//! orchestrator and the agent backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{QueryId, SessionId, UserId};

/// Conversational context sent along with a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    /// Patient the question is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    /// Topics discussed earlier in the conversation.
    #[serde(default)]
    pub previous_topics: Vec<String>,
    /// User preferences (language, tone, ...).
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

/// Execution options of a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Upper bound on returned sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    /// Per-query deadline. Falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Deliver the answer as `streaming_*` frames.
    #[serde(default)]
    pub streaming: bool,
    /// Skip the cache lookup (the result is still written back).
    #[serde(default)]
    pub bypass_cache: bool,
}

/// A query ready for execution.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    /// Query id (id of the originating frame).
    pub query_id: QueryId,
    /// Session the query belongs to.
    pub session_id: SessionId,
    /// Authenticated caller.
    pub user_id: UserId,
    /// Question text.
    pub query: String,
    /// Context.
    pub context: QueryContext,
    /// Options.
    pub options: QueryOptions,
}

/// Classification of a result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Plain text answer.
    #[default]
    Text,
    /// Structured data answer.
    Structured,
    /// Backend-reported error answer.
    Error,
}

/// Document or record backing an answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Title or identifier.
    #[serde(default)]
    pub title: String,
    /// Link, if the source is addressable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Relevance score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Token / call accounting reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Prompt tokens.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,
}

/// Answer to a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Answer text (or serialized structure for structured answers).
    #[serde(alias = "response", alias = "answer")]
    pub content: String,
    /// Classification.
    #[serde(default, rename = "type")]
    pub kind: ResultKind,
    /// Supporting sources.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Confidence in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Usage accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    /// Follow-up actions the UI may offer.
    #[serde(default, alias = "suggested_actions")]
    pub suggested_actions: Vec<String>,
    /// Wall-clock processing time on this server.
    #[serde(default)]
    pub processing_time_ms: u64,
    /// Served from cache.
    #[serde(default)]
    pub cached: bool,
}

impl QueryResult {
    /// Text answer with no extras.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: ResultKind::Text,
            sources: Vec::new(),
            confidence: None,
            usage: None,
            suggested_actions: Vec::new(),
            processing_time_ms: 0,
            cached: false,
        }
    }
}

/// JSON body of `POST {agentEndpoint}/api/ai/data-agent`.
#[derive(Clone, Debug, Serialize)]
pub struct BackendQuery<'a> {
    /// Question text.
    pub query: &'a str,
    /// Session id.
    pub session_id: &'a str,
    /// Caller id.
    pub user_id: &'a str,
    /// Patient id, duplicated at top level for the backend's convenience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<&'a str>,
    /// Conversational context.
    pub context: &'a QueryContext,
    /// Options.
    pub options: &'a QueryOptions,
}

impl<'a> BackendQuery<'a> {
    /// Borrow the request fields into a backend body.
    pub fn from_request(request: &'a QueryRequest) -> Self {
        Self {
            query: &request.query,
            session_id: request.session_id.as_str(),
            user_id: request.user_id.as_str(),
            patient_id: request.context.patient_id.as_deref(),
            context: &request.context,
            options: &request.options,
        }
    }
}
