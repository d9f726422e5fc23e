//! Raw streams for application protocols registered at runtime.

mod behavior;
mod control;
mod handler;
mod inbound;
mod upgrade;

pub use behavior::StreamBehavior;
pub use control::StreamControl;
pub use inbound::IncomingStreams;
