//! # clinic-server
//!
//! Axum HTTP + `WebSocket` gateway between chat clients and the agent service.
//!
//! - `WebSocket` transport: registration, outbound queue, heartbeat pings
//! - Handshake: JWT verification, version and capability negotiation
//! - Router: decode, freshness, rate limit, handshake gate, session ownership,
//!   validation and dispatch to typed handlers
//! - Query orchestration: cache, timeout, cancellation, streaming and a
//!   circuit breaker in front of the agent backend
//! - Lifecycle events fanned out to subscribed connections
//! - `/health`, `/metrics` and graceful shutdown

#![deny(unsafe_code)]

pub mod connection;
pub mod events;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;

pub use server::{Gateway, ServerHandle};
