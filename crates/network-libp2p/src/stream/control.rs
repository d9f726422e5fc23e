//! Handle for opening and accepting streams outside the swarm task.

use super::{
    behavior::StreamCommand,
    inbound::{InboundProtocols, IncomingStreams},
};
use crate::error::{NetworkError, NetworkResult};
use futures::channel::{mpsc, oneshot};
use libp2p::{PeerId, Stream, StreamProtocol};
use parking_lot::Mutex;
use std::{io, sync::Arc};

/// Cloneable handle to the [StreamBehavior](super::StreamBehavior).
#[derive(Clone)]
pub struct StreamControl {
    /// Registrations shared with the connection handlers.
    inbound: Arc<Mutex<InboundProtocols>>,
    /// Outbound requests for the behavior.
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamControl").finish_non_exhaustive()
    }
}

impl StreamControl {
    /// Create a new instance of Self.
    pub(crate) fn new(
        inbound: Arc<Mutex<InboundProtocols>>,
        commands: mpsc::UnboundedSender<StreamCommand>,
    ) -> Self {
        Self { inbound, commands }
    }

    /// Open a stream to the peer, dialing it if there is no connection yet.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> NetworkResult<Stream> {
        let (reply, stream) = oneshot::channel();
        self.commands
            .unbounded_send(StreamCommand::OpenStream { peer, protocol, reply })
            .map_err(|e| NetworkError::MpscSender(e.to_string()))?;

        // the reply is dropped if the connection closes mid-negotiation
        stream.await.map_err(|_| {
            NetworkError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "connection closed"))
        })?
    }

    /// Accept inbound streams for a protocol until the returned receiver is dropped.
    ///
    /// Fails with [NetworkError::AlreadyRegistered] while an earlier receiver for the protocol
    /// is still alive.
    pub fn accept(&self, protocol: StreamProtocol) -> NetworkResult<IncomingStreams> {
        self.inbound.lock().accept(protocol)
    }
}
