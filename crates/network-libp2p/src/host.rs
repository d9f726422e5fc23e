//! The boundary between the helper's stream registry and the peer-to-peer host.
//!
//! The RPC layer only talks to the network through [Host]. The libp2p-backed
//! [NetworkHandle](crate::NetworkHandle) is the production implementation; tests use an in-memory
//! one.

use crate::error::NetworkResult;
use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, Stream};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::time::Duration;

/// Addresses known for a peer at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's identity.
    pub peer_id: PeerId,
    /// Known addresses, most relevant first.
    ///
    /// Addresses this node dialed come before addresses the peer reported through identify.
    pub addresses: Vec<Multiaddr>,
}

impl PeerInfo {
    /// Create a new instance of Self.
    pub fn new(peer_id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self { peer_id, addresses }
    }
}

/// Peer-to-peer host operations used by the helper.
#[async_trait]
pub trait Host: Clone + Send + Sync + 'static {
    /// A negotiated, bidirectional byte stream to a peer.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Inbound streams for a registered protocol.
    ///
    /// Dropping this value removes the registration: peers negotiating the protocol afterwards
    /// are refused during protocol negotiation.
    type IncomingStreams: Stream<Item = (PeerId, Self::Stream)> + Send + Unpin + 'static;

    /// This node's peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Dial an address and wait until the connection is established.
    async fn connect(&self, addr: Multiaddr) -> NetworkResult<PeerId>;

    /// Open an outbound stream to `peer` negotiating `protocol`.
    ///
    /// The whole operation (dial if needed, negotiation) is bounded by `timeout`.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> NetworkResult<Self::Stream>;

    /// Register this node as able to accept inbound streams for `protocol`.
    fn set_stream_handler(&self, protocol: StreamProtocol)
        -> NetworkResult<Self::IncomingStreams>;

    /// Return the addresses currently known for `peer`.
    async fn peer_info(&self, peer: PeerId) -> NetworkResult<PeerInfo>;

    /// Return the addresses this node is listening on.
    async fn listen_addrs(&self) -> NetworkResult<Vec<Multiaddr>>;

    /// Return every currently connected peer.
    async fn connected_peers(&self) -> NetworkResult<Vec<PeerInfo>>;
}
