//! Conversation history and feedback storage.
//!
//! Both are side effects of query handling: failures are logged by the
//! caller and never reach the client.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::ids::{SessionId, UserId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// Default number of turns kept per session by the in-memory log.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Storage failure of a history or feedback backend.
#[derive(Debug, Error)]
#[error("history store error: {0}")]
pub struct HistoryError(pub String);

/// Author of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Clinic staff member.
    User,
    /// Agent answer.
    Assistant,
}

/// One recorded turn.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
    /// Query this turn belongs to.
    pub query_id: String,
    /// Recording time.
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Build a turn stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>, query_id: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            query_id: query_id.into(),
            at: Utc::now(),
        }
    }
}

/// Append-only per-session conversation log.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Record one turn.
    async fn append(&self, session_id: &SessionId, turn: ConversationTurn) -> Result<(), HistoryError>;

    /// Most recent `limit` turns, oldest first.
    async fn recent(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ConversationTurn>, HistoryError>;
}

/// Bounded in-process log.
pub struct InMemoryConversationLog {
    turns: DashMap<SessionId, VecDeque<ConversationTurn>>,
    limit: usize,
}

impl InMemoryConversationLog {
    /// Keep at most `limit` turns per session.
    pub fn new(limit: usize) -> Self {
        Self {
            turns: DashMap::new(),
            limit: limit.max(1),
        }
    }
}

impl Default for InMemoryConversationLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append(&self, session_id: &SessionId, turn: ConversationTurn) -> Result<(), HistoryError> {
        let mut turns = self.turns.entry(session_id.clone()).or_default();
        turns.push_back(turn);
        while turns.len() > self.limit {
            let _ = turns.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ConversationTurn>, HistoryError> {
        Ok(self
            .turns
            .get(session_id)
            .map(|turns| {
                let skip = turns.len().saturating_sub(limit);
                turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }
}

/// A rating of a previous answer.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    /// Session the rated answer belongs to.
    pub session_id: SessionId,
    /// Who rated.
    pub user_id: UserId,
    /// Rated message.
    pub message_id: String,
    /// Rating in `1..=5`.
    pub rating: u8,
    /// Optional free text.
    pub comment: Option<String>,
    /// When it was received.
    pub received_at: DateTime<Utc>,
}

/// Destination of feedback records.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// Store one record.
    async fn record(&self, feedback: FeedbackRecord) -> Result<(), HistoryError>;
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct InMemoryFeedbackSink {
    records: Mutex<Vec<FeedbackRecord>>,
}

impl InMemoryFeedbackSink {
    /// Snapshot of stored records.
    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl FeedbackSink for InMemoryFeedbackSink {
    async fn record(&self, feedback: FeedbackRecord) -> Result<(), HistoryError> {
        self.records.lock().push(feedback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("abc12345").unwrap()
    }

    #[tokio::test]
    async fn log_keeps_order_and_bound() {
        let log = InMemoryConversationLog::new(3);
        for i in 0..5 {
            log.append(&sid(), ConversationTurn::new(Role::User, format!("q{i}"), format!("id{i}")))
                .await
                .unwrap();
        }
        let turns = log.recent(&sid(), 10).await.unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(texts, ["q2", "q3", "q4"]);
    }

    #[tokio::test]
    async fn recent_returns_tail() {
        let log = InMemoryConversationLog::default();
        log.append(&sid(), ConversationTurn::new(Role::User, "question", "q1")).await.unwrap();
        log.append(&sid(), ConversationTurn::new(Role::Assistant, "answer", "q1")).await.unwrap();
        let turns = log.recent(&sid(), 1).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn unknown_session_is_empty() {
        let log = InMemoryConversationLog::default();
        assert!(log.recent(&sid(), 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn feedback_sink_stores_records() {
        let sink = InMemoryFeedbackSink::default();
        sink.record(FeedbackRecord {
            session_id: sid(),
            user_id: UserId::from("u1"),
            message_id: "m1".into(),
            rating: 4,
            comment: None,
            received_at: Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].rating, 4);
    }
}
