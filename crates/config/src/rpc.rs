//! Configuration for the RPC surface exposed to the control plane.

use serde::{Deserialize, Serialize};

/// Max RPC message size in bytes (10 MiB).
///
/// Applies to the uncompressed encoding of a single request, response, or push message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Configuration for RPC framing and delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// The maximum size (bytes) of a single decoded message.
    pub max_message_size: usize,
    /// Capacity of the channel carrying responses and push messages to the writer.
    pub outbound_channel_capacity: usize,
    /// Size of the buffer used by each stream reader.
    ///
    /// Every successful read produces at most one `IncomingStreamData` push of this size.
    pub read_buffer_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_channel_capacity: 1024,
            read_buffer_size: 64 * 1024,
        }
    }
}
