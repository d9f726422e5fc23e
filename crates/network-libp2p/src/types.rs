//! Commands for the swarm and the handle used to send them.

use crate::{
    error::{NetworkError, NetworkResult},
    host::{Host, PeerInfo},
    stream::{IncomingStreams, StreamControl},
};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};
use std::{fmt, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Commands for the swarm.
#[derive(Debug)]
pub enum NetworkCommand {
    /// Listeners
    GetListener { reply: oneshot::Sender<Vec<Multiaddr>> },
    /// Dial an address and report the peer once the connection is established.
    Dial {
        /// The address to dial. A trailing `/p2p/<peer id>` is verified by the swarm.
        addr: Multiaddr,
        /// Oneshot for reply
        reply: oneshot::Sender<NetworkResult<PeerId>>,
    },
    /// Return the addresses known for a peer.
    PeerInfo { peer_id: PeerId, reply: oneshot::Sender<PeerInfo> },
    /// Return all connected peers.
    ConnectedPeers { reply: oneshot::Sender<Vec<PeerInfo>> },
}

/// Network handle.
///
/// Commands travel to the swarm task through a channel. Streams are opened and accepted
/// directly through the [StreamControl], which does not need the swarm task to reply.
#[derive(Clone)]
pub struct NetworkHandle {
    /// Sending channel to the network to process commands.
    sender: mpsc::Sender<NetworkCommand>,
    /// Control for opening and accepting streams.
    control: StreamControl,
    /// This node's peer id.
    local_peer_id: PeerId,
}

impl fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkHandle").field("local_peer_id", &self.local_peer_id).finish()
    }
}

impl NetworkHandle {
    /// Create a new instance of Self.
    pub fn new(
        sender: mpsc::Sender<NetworkCommand>,
        control: StreamControl,
        local_peer_id: PeerId,
    ) -> Self {
        Self { sender, control, local_peer_id }
    }

    /// Request listeners from the swarm.
    pub async fn listeners(&self) -> NetworkResult<Vec<Multiaddr>> {
        let (reply, listeners) = oneshot::channel();
        self.sender.send(NetworkCommand::GetListener { reply }).await?;
        Ok(listeners.await?)
    }

    /// Dial a peer and wait for the connection.
    pub async fn dial(&self, addr: Multiaddr) -> NetworkResult<PeerId> {
        let (reply, ack) = oneshot::channel();
        self.sender.send(NetworkCommand::Dial { addr, reply }).await?;
        ack.await?
    }

    /// Retrieve the addresses known for a peer.
    pub async fn known_peer_info(&self, peer_id: PeerId) -> NetworkResult<PeerInfo> {
        let (reply, info) = oneshot::channel();
        self.sender.send(NetworkCommand::PeerInfo { peer_id, reply }).await?;
        Ok(info.await?)
    }

    /// Retrieve all connected peers.
    pub async fn connected(&self) -> NetworkResult<Vec<PeerInfo>> {
        let (reply, peers) = oneshot::channel();
        self.sender.send(NetworkCommand::ConnectedPeers { reply }).await?;
        Ok(peers.await?)
    }
}

#[async_trait]
impl Host for NetworkHandle {
    type Stream = Stream;
    type IncomingStreams = IncomingStreams;

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn connect(&self, addr: Multiaddr) -> NetworkResult<PeerId> {
        self.dial(addr).await
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> NetworkResult<Self::Stream> {
        debug!(target: "helper-network", ?peer, %protocol, "opening stream");
        tokio::time::timeout(timeout, self.control.open_stream(peer, protocol))
            .await
            .map_err(|_| NetworkError::Timeout(timeout))?
    }

    fn set_stream_handler(
        &self,
        protocol: StreamProtocol,
    ) -> NetworkResult<Self::IncomingStreams> {
        self.control.accept(protocol)
    }

    async fn peer_info(&self, peer: PeerId) -> NetworkResult<PeerInfo> {
        self.known_peer_info(peer).await
    }

    async fn listen_addrs(&self) -> NetworkResult<Vec<Multiaddr>> {
        self.listeners().await
    }

    async fn connected_peers(&self) -> NetworkResult<Vec<PeerInfo>> {
        self.connected().await
    }
}
