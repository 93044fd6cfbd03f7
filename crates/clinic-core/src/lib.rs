//! # clinic-core
//!
//! Foundation types shared by every crate of the clinic gateway:
//!
//! - **IDs**: branded newtypes for connections, queries and users, plus the
//!   validated client-supplied [`SessionId`]
//! - **Errors**: the closed [`ErrorCode`] set and [`GatewayError`]
//! - **Wire envelope**: [`Message`], [`MessageType`] and typed payloads
//! - **Queries**: [`QueryRequest`] / [`QueryResult`] exchanged with the agent backend
//! - **Events**: the [`GatewayEvent`] lifecycle union
//! - **Logging**: subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod message;
pub mod payloads;
pub mod query;

pub use errors::{ErrorCode, GatewayError, Result};
pub use events::GatewayEvent;
pub use ids::{ConnectionId, QueryId, SessionId, UserId};
pub use message::{Message, MessageMetadata, MessageType};
pub use query::{QueryContext, QueryOptions, QueryRequest, QueryResult, ResultKind};
