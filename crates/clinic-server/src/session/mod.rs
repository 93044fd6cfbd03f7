//! Session state: the authoritative store plus conversation and feedback logs.

pub mod history;
pub mod store;

pub use history::{
    ConversationLog, ConversationTurn, FeedbackRecord, FeedbackSink, HistoryError,
    InMemoryConversationLog, InMemoryFeedbackSink, Role,
};
pub use store::{Session, SessionPatch, SessionStore};
