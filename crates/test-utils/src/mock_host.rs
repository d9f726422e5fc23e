//! In-memory [Host] for unit tests.
//!
//! Hosts created from the same [MockNetwork] can connect to each other and open streams backed by
//! in-memory pipes. Protocol negotiation follows libp2p: a stream only opens if the remote host
//! has a live registration for the protocol.

use async_trait::async_trait;
use futures::{channel::mpsc, AsyncRead, AsyncWrite};
use lh_network_libp2p::{
    Host, Multiaddr, NetworkError, NetworkResult, PeerId, PeerInfo, Protocol, StreamProtocol,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::io::DuplexStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt as _};

/// A stream between two mock hosts.
///
/// Reads and writes go through an in-memory pipe. Streams opened while
/// [MockNetwork::set_broken_writes] is on fail every write with `BrokenPipe` and keep reading
/// normally.
#[derive(Debug)]
pub struct MockStream {
    inner: Compat<DuplexStream>,
    broken_writes: bool,
}

impl MockStream {
    fn new(inner: DuplexStream, broken_writes: bool) -> Self {
        Self { inner: inner.compat(), broken_writes }
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure")
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.broken_writes {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.broken_writes {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Inbound streams for a protocol registered on a mock host.
pub type MockIncomingStreams = mpsc::UnboundedReceiver<(PeerId, MockStream)>;

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// State of one mock host.
#[derive(Debug)]
struct MockNode {
    /// The address other hosts connect to.
    address: Multiaddr,
    /// Live protocol registrations.
    handlers: HashMap<StreamProtocol, mpsc::UnboundedSender<(PeerId, MockStream)>>,
    /// Connected peers.
    connected: HashSet<PeerId>,
}

/// Shared state of every host on the network.
#[derive(Debug, Default)]
struct Hub {
    nodes: HashMap<PeerId, MockNode>,
    /// Next `/memory` port.
    next_port: u64,
    /// Added to every stream open.
    open_delay: Option<Duration>,
    /// Streams opened from now on fail their writes.
    broken_writes: bool,
}

impl Hub {
    /// Mark two peers as connected.
    fn connect(&mut self, a: PeerId, b: PeerId) {
        if let Some(node) = self.nodes.get_mut(&a) {
            node.connected.insert(b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.connected.insert(a);
        }
    }

    fn peer_info(&self, peer_id: PeerId) -> PeerInfo {
        let addresses =
            self.nodes.get(&peer_id).map(|node| vec![node.address.clone()]).unwrap_or_default();
        PeerInfo::new(peer_id, addresses)
    }
}

/// An in-memory network of [MockHost]s.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MockNetwork {
    /// Create a new instance of Self.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host with a random peer id.
    pub fn host(&self) -> MockHost {
        let peer_id = PeerId::random();
        let mut hub = self.hub.lock();
        hub.next_port += 1;
        let address = Multiaddr::empty().with(Protocol::Memory(hub.next_port));
        hub.nodes.insert(
            peer_id,
            MockNode { address, handlers: HashMap::new(), connected: HashSet::new() },
        );
        MockHost { peer_id, network: self.clone() }
    }

    /// Delay every stream open by `delay`.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.hub.lock().open_delay = delay;
    }

    /// Make every stream opened from now on fail its writes.
    pub fn set_broken_writes(&self, broken: bool) {
        self.hub.lock().broken_writes = broken;
    }

    /// True if `peer_id` would accept a stream for `protocol` right now.
    pub fn accepts(&self, peer_id: PeerId, protocol: &StreamProtocol) -> bool {
        let hub = self.hub.lock();
        hub.nodes
            .get(&peer_id)
            .and_then(|node| node.handlers.get(protocol))
            .is_some_and(|sender| !sender.is_closed())
    }
}

/// A host on a [MockNetwork].
#[derive(Debug, Clone)]
pub struct MockHost {
    peer_id: PeerId,
    network: MockNetwork,
}

impl MockHost {
    /// The network this host belongs to.
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    /// The address other hosts use to connect.
    pub fn address(&self) -> Multiaddr {
        let hub = self.network.hub.lock();
        hub.nodes.get(&self.peer_id).map(|node| node.address.clone()).unwrap_or_else(Multiaddr::empty)
    }
}

#[async_trait]
impl Host for MockHost {
    type Stream = MockStream;
    type IncomingStreams = MockIncomingStreams;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn connect(&self, addr: Multiaddr) -> NetworkResult<PeerId> {
        let mut hub = self.network.hub.lock();
        let peer_id = hub
            .nodes
            .iter()
            .find(|(_, node)| node.address == addr)
            .map(|(peer_id, _)| *peer_id)
            .ok_or_else(|| {
                NetworkError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "no host at address"))
            })?;
        hub.connect(self.peer_id, peer_id);
        Ok(peer_id)
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> NetworkResult<Self::Stream> {
        let delay = self.network.hub.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .map_err(|_| NetworkError::Timeout(timeout))?;
        }

        let mut hub = self.network.hub.lock();
        let sender = hub
            .nodes
            .get(&peer)
            .ok_or_else(|| {
                NetworkError::Io(io::Error::new(io::ErrorKind::NotConnected, "unknown peer"))
            })?
            .handlers
            .get(&protocol)
            .filter(|sender| !sender.is_closed())
            .cloned()
            .ok_or_else(|| NetworkError::UnsupportedProtocol(protocol.clone()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let broken_writes = hub.broken_writes;
        sender
            .unbounded_send((self.peer_id, MockStream::new(remote, broken_writes)))
            .map_err(|_| NetworkError::UnsupportedProtocol(protocol))?;
        hub.connect(self.peer_id, peer);

        Ok(MockStream::new(local, broken_writes))
    }

    fn set_stream_handler(
        &self,
        protocol: StreamProtocol,
    ) -> NetworkResult<Self::IncomingStreams> {
        let mut hub = self.network.hub.lock();
        let node = hub.nodes.get_mut(&self.peer_id).ok_or_else(|| {
            NetworkError::Io(io::Error::new(io::ErrorKind::NotFound, "host removed"))
        })?;

        // a dropped receiver releases its registration
        node.handlers.retain(|_, sender| !sender.is_closed());
        if node.handlers.contains_key(&protocol) {
            return Err(NetworkError::AlreadyRegistered(protocol));
        }

        let (sender, incoming) = mpsc::unbounded();
        node.handlers.insert(protocol, sender);
        Ok(incoming)
    }

    async fn peer_info(&self, peer: PeerId) -> NetworkResult<PeerInfo> {
        Ok(self.network.hub.lock().peer_info(peer))
    }

    async fn listen_addrs(&self) -> NetworkResult<Vec<Multiaddr>> {
        Ok(vec![self.address()])
    }

    async fn connected_peers(&self) -> NetworkResult<Vec<PeerInfo>> {
        let hub = self.network.hub.lock();
        let mut connected: Vec<PeerId> = hub
            .nodes
            .get(&self.peer_id)
            .map(|node| node.connected.iter().copied().collect())
            .unwrap_or_default();
        connected.sort();
        Ok(connected.into_iter().map(|peer_id| hub.peer_info(peer_id)).collect())
    }
}
