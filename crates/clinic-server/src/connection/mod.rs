//! Connection registry, per-connection state and the client handshake.

pub mod client;
pub mod handshake;
pub mod registry;

pub use client::{
    AuthInfo, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, Connection, ConnectionInfo,
    ConnectionState, Outbound,
};
pub use handshake::{AuthError, Authenticator, Claims};
pub use registry::{ConnectionRegistry, RegistryError, RegistryStats};
