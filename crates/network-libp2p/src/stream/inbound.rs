//! Inbound protocol registrations shared by every connection handler.

use crate::error::{NetworkError, NetworkResult};
use futures::channel::mpsc;
use libp2p::{PeerId, Stream, StreamProtocol};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Inbound streams waiting for the accept loop before new ones are dropped.
const INBOUND_STREAM_BUFFER: usize = 16;

/// Inbound streams negotiated for one protocol.
///
/// Dropping the receiver releases the registration.
pub type IncomingStreams = mpsc::Receiver<(PeerId, Stream)>;

/// Protocols accepted from remote peers and the channels their streams are delivered on.
#[derive(Debug, Default)]
pub(crate) struct InboundProtocols {
    /// Delivery channel for each registered protocol.
    senders: HashMap<StreamProtocol, mpsc::Sender<(PeerId, Stream)>>,
}

impl InboundProtocols {
    /// Register a protocol.
    ///
    /// Registrations whose [IncomingStreams] was dropped are released first, so a protocol can be
    /// registered again as soon as the previous receiver is gone.
    pub(crate) fn accept(&mut self, protocol: StreamProtocol) -> NetworkResult<IncomingStreams> {
        self.release_closed();
        if self.senders.contains_key(&protocol) {
            return Err(NetworkError::AlreadyRegistered(protocol));
        }

        let (sender, receiver) = mpsc::channel(INBOUND_STREAM_BUFFER);
        self.senders.insert(protocol, sender);
        Ok(receiver)
    }

    /// The protocols with a live registration.
    pub(crate) fn supported(&mut self) -> Vec<StreamProtocol> {
        self.release_closed();
        self.senders.keys().cloned().collect()
    }

    /// Hand a negotiated inbound stream to the protocol's receiver.
    ///
    /// The stream is dropped, which resets it for the remote, if the receiver is gone or not
    /// keeping up.
    pub(crate) fn deliver(&mut self, peer: PeerId, protocol: StreamProtocol, stream: Stream) {
        let Some(sender) = self.senders.get_mut(&protocol) else {
            debug!(target: "helper-network", ?peer, %protocol, "no handler for inbound stream");
            return;
        };

        match sender.try_send((peer, stream)) {
            Ok(()) => {}
            Err(e) if e.is_full() => {
                warn!(target: "helper-network", ?peer, %protocol, "inbound stream buffer full, dropping stream");
            }
            Err(_) => {
                debug!(target: "helper-network", ?peer, %protocol, "handler removed during negotiation");
                self.senders.remove(&protocol);
            }
        }
    }

    /// Forget registrations whose receiver was dropped.
    fn release_closed(&mut self) {
        self.senders.retain(|_, sender| !sender.is_closed());
    }
}
