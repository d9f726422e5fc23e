//! Shared state of the helper: open streams and accepted protocols.

mod handlers;
mod streams;

pub use handlers::ProtocolHandlers;
pub(crate) use handlers::ProtocolHandler;
pub use streams::{StreamHandle, StreamRegistry, StreamState};
