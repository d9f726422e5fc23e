//! RPC surface of the helper process.
//!
//! The client drives the helper with [RpcRequest](messages::RpcRequest)s. The [App] keeps the
//! registry of open streams and accepted protocols, the [Dispatcher] routes each request to its
//! operation, and the [RpcServer] moves frames between the client transport and the dispatcher.

mod app;
mod codec;
mod dispatch;
pub mod error;
pub mod messages;
mod reader;
pub mod registry;
mod server;

pub use app::App;
pub use codec::RpcCodec;
pub use dispatch::Dispatcher;
pub use error::{HelperError, HelperResult};
pub use server::RpcServer;
