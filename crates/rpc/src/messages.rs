//! Messages exchanged with the control-plane client.
//!
//! The client sends [RpcRequest] envelopes. The helper answers every request with exactly one
//! [RpcResponse] carrying the request's seqno, and sends unsolicited [Push] notifications for
//! stream activity. Both travel as [ServerMessage]s.

use crate::error::{HelperError, HelperResult};
use serde::{Deserialize, Serialize};

/// Identifies a stream within this helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    /// The id assigned by the stream registry.
    pub id: u64,
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self { id }
    }
}

/// A peer referenced by a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    /// Base58 encoded peer id.
    pub id: String,
}

/// Addresses known for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Base58 encoded peer id.
    pub id: String,
    /// Multiaddresses in their string form, most relevant first.
    pub addresses: Vec<String>,
}

impl From<lh_network_libp2p::PeerInfo> for PeerInfo {
    fn from(info: lh_network_libp2p::PeerInfo) -> Self {
        Self {
            id: info.peer_id.to_string(),
            addresses: info.addresses.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Bytes sent on a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// The target stream.
    pub stream_id: StreamId,
    /// Opaque payload.
    pub data: Vec<u8>,
}

/// Requests from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Accept inbound streams negotiating `protocol`.
    AddStreamHandler { protocol: String },
    /// Stop accepting inbound streams for `protocol`.
    RemoveStreamHandler { protocol: String },
    /// Open an outbound stream to a peer.
    OpenStream { protocol_id: String, peer: PeerRef },
    /// Gracefully close a stream.
    CloseStream { stream_id: StreamId },
    /// Abruptly terminate a stream.
    ResetStream { stream_id: StreamId },
    /// Write bytes to a stream.
    SendStream { msg: StreamMessage },
    /// Dial a peer by multiaddress.
    AddPeer { multiaddr: String },
    /// The addresses this helper listens on.
    GetListeningAddrs,
    /// All connected peers.
    ListPeers,
}

impl Request {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddStreamHandler { .. } => "AddStreamHandler",
            Self::RemoveStreamHandler { .. } => "RemoveStreamHandler",
            Self::OpenStream { .. } => "OpenStream",
            Self::CloseStream { .. } => "CloseStream",
            Self::ResetStream { .. } => "ResetStream",
            Self::SendStream { .. } => "SendStream",
            Self::AddPeer { .. } => "AddPeer",
            Self::GetListeningAddrs => "GetListeningAddrs",
            Self::ListPeers => "ListPeers",
        }
    }

    /// Encode the request into an envelope body.
    pub fn encode(&self) -> HelperResult<Vec<u8>> {
        bcs::to_bytes(self).map_err(|e| HelperError::MalformedRequest(e.to_string()))
    }

    /// Decode an envelope body.
    pub fn decode(body: &[u8]) -> HelperResult<Self> {
        bcs::from_bytes(body).map_err(|e| HelperError::MalformedRequest(e.to_string()))
    }
}

/// Successful results, one variant per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Success {
    AddStreamHandler,
    RemoveStreamHandler,
    OpenStream { stream_id: StreamId, peer: PeerInfo },
    CloseStream,
    ResetStream,
    SendStream,
    AddPeer { peer: PeerInfo },
    GetListeningAddrs { addrs: Vec<String> },
    ListPeers { peers: Vec<PeerInfo> },
}

/// The request envelope.
///
/// The body is decoded separately so a request with an unreadable body still gets an error
/// response carrying its seqno.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Client-chosen correlation token.
    pub seqno: u64,
    /// The encoded [Request].
    pub body: Vec<u8>,
}

impl RpcRequest {
    /// Create an envelope for a request.
    pub fn new(seqno: u64, request: &Request) -> HelperResult<Self> {
        Ok(Self { seqno, body: request.encode()? })
    }
}

/// The outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResult {
    Success(Success),
    Error(String),
}

/// The response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// The seqno of the request this response answers.
    pub seqno: u64,
    /// Success payload or error text.
    pub result: RpcResult,
}

impl RpcResponse {
    /// Successful response.
    pub fn success(seqno: u64, success: Success) -> Self {
        Self { seqno, result: RpcResult::Success(success) }
    }

    /// Error response.
    pub fn error(seqno: u64, error: impl ToString) -> Self {
        Self { seqno, result: RpcResult::Error(error.to_string()) }
    }

    /// The success payload, if any.
    pub fn as_success(&self) -> Option<&Success> {
        match &self.result {
            RpcResult::Success(success) => Some(success),
            RpcResult::Error(_) => None,
        }
    }

    /// The error text, if any.
    pub fn as_error(&self) -> Option<&str> {
        match &self.result {
            RpcResult::Success(_) => None,
            RpcResult::Error(e) => Some(e),
        }
    }
}

/// Unsolicited notifications. These are not correlated to any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Push {
    /// Bytes read from a stream.
    IncomingStreamData { stream_id: StreamId, data: Vec<u8> },
    /// A peer opened a stream for a registered protocol.
    IncomingStream { stream_id: StreamId, peer: PeerInfo, protocol: String },
    /// The remote peer closed the stream. It is no longer registered.
    StreamComplete { stream_id: StreamId },
    /// Reading from the stream failed. It is no longer registered.
    StreamLost { stream_id: StreamId, reason: String },
}

impl Push {
    /// The stream this notification is about.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::IncomingStreamData { stream_id, .. }
            | Self::IncomingStream { stream_id, .. }
            | Self::StreamComplete { stream_id }
            | Self::StreamLost { stream_id, .. } => *stream_id,
        }
    }
}

/// Everything the helper writes to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Response(RpcResponse),
    Push(Push),
}
