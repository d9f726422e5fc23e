//! The helper's application context and the RPC operations.

use crate::{
    error::{HelperError, HelperResult},
    messages::{PeerInfo, Push, ServerMessage, StreamId, Success},
    reader::read_stream,
    registry::{ProtocolHandler, ProtocolHandlers, StreamHandle, StreamRegistry, StreamState},
};
use futures::{io::ReadHalf, AsyncReadExt as _, StreamExt as _};
use lh_config::HelperConfig;
use lh_network_libp2p::{Host, Multiaddr, PeerId, StreamProtocol};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-process state shared by every request and background task.
///
/// Cheap to clone.
pub struct App<H: Host> {
    inner: Arc<AppInner<H>>,
}

impl<H: Host> Clone for App<H> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<H: Host> fmt::Debug for App<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("local_peer_id", &self.inner.host.local_peer_id())
            .field("streams", &self.inner.streams)
            .finish()
    }
}

/// The shared state behind [App].
struct AppInner<H: Host> {
    /// The peer-to-peer host.
    host: H,
    /// Open streams.
    streams: StreamRegistry<H::Stream>,
    /// Protocols accepted from remote peers.
    handlers: ProtocolHandlers<H::IncomingStreams>,
    /// Responses and push notifications for the client.
    outbound: mpsc::Sender<ServerMessage>,
    /// Upper bound for opening a stream.
    open_stream_timeout: Duration,
    /// Size of each read from a stream.
    read_buffer_size: usize,
    /// Cancelled when the helper cannot continue.
    shutdown: CancellationToken,
}

impl<H: Host> App<H> {
    /// Create a new instance of Self.
    pub fn new(host: H, config: &HelperConfig, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let inner = AppInner {
            host,
            streams: StreamRegistry::default(),
            handlers: ProtocolHandlers::default(),
            outbound,
            open_stream_timeout: config.network.open_stream_timeout(),
            read_buffer_size: config.rpc.read_buffer_size.max(1),
            shutdown: CancellationToken::new(),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    /// The stream registry.
    pub fn streams(&self) -> &StreamRegistry<H::Stream> {
        &self.inner.streams
    }

    /// The protocol handler registry.
    pub fn handlers(&self) -> &ProtocolHandlers<H::IncomingStreams> {
        &self.inner.handlers
    }

    /// Cancelled after a fatal error.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn read_buffer_size(&self) -> usize {
        self.inner.read_buffer_size
    }

    /// Send a push notification to the client.
    ///
    /// Notifications are dropped once the client writer is gone.
    pub(crate) async fn push(&self, push: Push) {
        if self.inner.outbound.send(ServerMessage::Push(push)).await.is_err() {
            debug!(target: "rpc-dispatch", "client writer closed, dropping push");
        }
    }

    /// Accept inbound streams negotiating `protocol`.
    ///
    /// Adding a registered protocol replaces its accept task and keeps the host registration.
    pub async fn add_stream_handler(&self, protocol: String) -> HelperResult<Success> {
        let protocol = parse_protocol(protocol)?;
        let host = &self.inner.host;

        self.inner
            .handlers
            .register(protocol.clone(), |previous| {
                let incoming = match previous {
                    Some(incoming) => incoming,
                    None => host.set_stream_handler(protocol.clone())?,
                };
                let cancel = CancellationToken::new();
                let task = tokio::spawn(accept_streams(
                    self.clone(),
                    protocol.clone(),
                    incoming,
                    cancel.clone(),
                ));
                Ok(ProtocolHandler::new(cancel, task))
            })
            .await?;

        info!(target: "rpc-dispatch", %protocol, "stream handler added");
        Ok(Success::AddStreamHandler)
    }

    /// Stop accepting inbound streams for `protocol`.
    ///
    /// Streams already accepted stay open. Removing an unknown protocol succeeds.
    pub async fn remove_stream_handler(&self, protocol: String) -> HelperResult<Success> {
        let protocol = parse_protocol(protocol)?;
        if self.inner.handlers.remove(&protocol).await {
            info!(target: "rpc-dispatch", %protocol, "stream handler removed");
        }
        Ok(Success::RemoveStreamHandler)
    }

    /// Open an outbound stream.
    ///
    /// The stream is registered and its reader started before this returns. The peer info reflects
    /// the addresses the host knows at call time.
    pub async fn open_stream(&self, peer: String, protocol: String) -> HelperResult<Success> {
        let peer_id = parse_peer_id(&peer)?;
        let protocol = parse_protocol(protocol)?;

        let stream = self
            .inner
            .host
            .open_stream(peer_id, protocol.clone(), self.inner.open_stream_timeout)
            .await?;

        let (handle, reader) = self.insert_stream(peer_id, protocol, stream)?;
        let id = handle.id();
        self.start_reader(&handle, reader);

        let peer = match self.inner.host.peer_info(peer_id).await {
            Ok(info) => PeerInfo::from(info),
            Err(e) => {
                // the client never learns the id, so the stream cannot stay registered
                if let Some(handle) = self.inner.streams.remove(id, StreamState::Reset) {
                    handle.reset().await;
                }
                return Err(e.into());
            }
        };

        debug!(target: "rpc-dispatch", id, ?peer_id, "outbound stream opened");
        Ok(Success::OpenStream { stream_id: id.into(), peer })
    }

    /// Gracefully close a stream after in-flight sends complete.
    pub async fn close_stream(&self, id: u64) -> HelperResult<Success> {
        let handle =
            self.inner.streams.remove(id, StreamState::Closed).ok_or(HelperError::UnknownStreamId(id))?;
        handle.close().await?;
        debug!(target: "rpc-dispatch", id, "stream closed");
        Ok(Success::CloseStream)
    }

    /// Abruptly terminate a stream, discarding in-flight sends.
    pub async fn reset_stream(&self, id: u64) -> HelperResult<Success> {
        let handle =
            self.inner.streams.remove(id, StreamState::Reset).ok_or(HelperError::UnknownStreamId(id))?;
        handle.reset().await;
        debug!(target: "rpc-dispatch", id, "stream reset");
        Ok(Success::ResetStream)
    }

    /// Write bytes to a stream.
    ///
    /// A failed write resets the stream.
    pub async fn send_stream(&self, id: u64, data: Vec<u8>) -> HelperResult<Success> {
        let handle = self.inner.streams.lookup(id).ok_or(HelperError::UnknownStreamId(id))?;

        if let Err(e) = handle.send(&data).await {
            warn!(target: "rpc-dispatch", id, ?e, "send failed, resetting stream");
            if let Some(handle) = self.inner.streams.remove(id, StreamState::Reset) {
                handle.reset().await;
            }
            return Err(e.into());
        }

        Ok(Success::SendStream)
    }

    /// Dial a peer and return its info once connected.
    pub async fn add_peer(&self, multiaddr: String) -> HelperResult<Success> {
        let addr: Multiaddr = multiaddr
            .parse()
            .map_err(|e| HelperError::MalformedRequest(format!("invalid multiaddr {multiaddr}: {e}")))?;
        let peer_id = self.inner.host.connect(addr).await?;
        let peer = self.inner.host.peer_info(peer_id).await?.into();
        info!(target: "rpc-dispatch", ?peer_id, "peer added");
        Ok(Success::AddPeer { peer })
    }

    /// The addresses this helper listens on.
    pub async fn listening_addrs(&self) -> HelperResult<Success> {
        let addrs = self.inner.host.listen_addrs().await?;
        Ok(Success::GetListeningAddrs { addrs: addrs.iter().map(ToString::to_string).collect() })
    }

    /// All connected peers.
    pub async fn list_peers(&self) -> HelperResult<Success> {
        let peers = self.inner.host.connected_peers().await?;
        Ok(Success::ListPeers { peers: peers.into_iter().map(Into::into).collect() })
    }

    /// Remove every handler and reset every open stream.
    pub async fn teardown(&self) {
        self.inner.handlers.clear().await;
        for handle in self.inner.streams.drain(StreamState::Reset) {
            handle.reset().await;
        }
    }

    /// Allocate an id and register a new stream.
    ///
    /// A duplicate id means the registry is corrupt: the helper shuts down.
    fn insert_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
        stream: H::Stream,
    ) -> HelperResult<(Arc<StreamHandle<H::Stream>>, ReadHalf<H::Stream>)> {
        let id = self.inner.streams.allocate();
        let (reader, writer) = stream.split();
        let handle = Arc::new(StreamHandle::new(id, peer_id, protocol, writer));

        if let Err(e) = self.inner.streams.insert(handle.clone()) {
            error!(target: "stream-registry", id, "stream id already registered, shutting down");
            self.inner.shutdown.cancel();
            return Err(e);
        }

        Ok((handle, reader))
    }

    /// Spawn the background reader for a registered stream.
    fn start_reader(&self, handle: &StreamHandle<H::Stream>, reader: ReadHalf<H::Stream>) {
        let task =
            tokio::spawn(read_stream(self.clone(), handle.id(), handle.shutdown_token(), reader));
        handle.set_reader(task);
    }

    /// Teardown after the reader saw EOF or an error.
    ///
    /// Returns false if the stream was already removed by a request.
    pub(crate) async fn release_stream(&self, id: u64, state: StreamState) -> bool {
        match self.inner.streams.remove(id, state) {
            Some(handle) => {
                handle.release_from_reader(state).await;
                true
            }
            None => false,
        }
    }
}

/// Register every inbound stream for `protocol` until cancelled.
///
/// Returns the host registration when cancelled, or `None` if the host ended it.
async fn accept_streams<H: Host>(
    app: App<H>,
    protocol: StreamProtocol,
    mut incoming: H::IncomingStreams,
    cancel: CancellationToken,
) -> Option<H::IncomingStreams> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(incoming),
            next = incoming.next() => next,
        };

        let Some((peer_id, stream)) = next else {
            warn!(target: "rpc-dispatch", %protocol, "host closed inbound registration");
            return None;
        };

        let peer = match app.inner.host.peer_info(peer_id).await {
            Ok(info) => PeerInfo::from(info),
            Err(e) => {
                debug!(target: "rpc-dispatch", ?peer_id, ?e, "no peer info for inbound stream");
                PeerInfo { id: peer_id.to_string(), addresses: Vec::new() }
            }
        };

        let (handle, reader) = match app.insert_stream(peer_id, protocol.clone(), stream) {
            Ok(registered) => registered,
            Err(_) => return None,
        };

        debug!(target: "rpc-dispatch", id = handle.id(), ?peer_id, %protocol, "inbound stream accepted");
        // announce the stream before any of its data
        app.push(Push::IncomingStream {
            stream_id: StreamId::from(handle.id()),
            peer,
            protocol: protocol.to_string(),
        })
        .await;
        app.start_reader(&handle, reader);
    }
}

/// Parse a protocol id. It must be non-empty and start with `/`.
fn parse_protocol(protocol: String) -> HelperResult<StreamProtocol> {
    StreamProtocol::try_from_owned(protocol.clone())
        .map_err(|_| HelperError::MalformedRequest(format!("invalid protocol id: {protocol:?}")))
}

/// Parse a base58 encoded peer id.
fn parse_peer_id(peer: &str) -> HelperResult<PeerId> {
    peer.parse().map_err(|e| HelperError::MalformedRequest(format!("invalid peer id {peer}: {e}")))
}

#[cfg(test)]
#[path = "tests/app_tests.rs"]
mod app_tests;
