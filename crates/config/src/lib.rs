//! Crate for configuring the helper process.
//!
//! Network-facing and RPC-facing configurations.
mod helper_config;
pub use helper_config::*;
mod network;
pub use network::*;
mod rpc;
pub use rpc::*;
