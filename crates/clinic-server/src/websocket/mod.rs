//! WebSocket transport: one task pair per upgraded socket.

pub mod session;

pub use session::run_ws_session;
