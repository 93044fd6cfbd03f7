//! Inbound message routing.
//!
//! [`MessageRouter`] runs every frame through a fixed pipeline and hands
//! survivors to the [`MessageHandler`] registered for their type in a
//! [`HandlerTable`]. Built-in handlers live in [`handlers`].

pub mod context;
pub mod handlers;
pub mod pipeline;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;
pub mod validation;

pub use context::RouterContext;
pub use handlers::builtin_handlers;
pub use pipeline::{MessageRouter, RouterStats};
pub use registry::{HandlerRequest, HandlerTable, MessageHandler};
