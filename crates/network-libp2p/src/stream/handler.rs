//! Per-connection handler for application streams.

use super::{inbound::InboundProtocols, upgrade::HelperStreamProtocol};
use crate::error::{NetworkError, NetworkResult};
use futures::channel::oneshot;
use libp2p::{
    swarm::{
        handler::{
            ConnectionEvent, DialUpgradeError, FullyNegotiatedInbound, FullyNegotiatedOutbound,
        },
        ConnectionHandler, ConnectionHandlerEvent, StreamUpgradeError, SubstreamProtocol,
    },
    PeerId, Stream, StreamProtocol,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    io,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::debug;

/// Reply for a caller waiting on an outbound stream.
pub type StreamReply = oneshot::Sender<NetworkResult<Stream>>;

/// Commands from behavior to handler.
#[derive(Debug)]
pub enum HandlerCommand {
    /// Open an outbound stream for the protocol.
    OpenStream {
        /// The protocol to propose.
        protocol: StreamProtocol,
        /// Channel for the negotiated stream.
        reply: StreamReply,
    },
}

/// Connection handler for application streams.
///
/// Inbound substreams are negotiated against the protocols registered at the time the remote
/// opens them and delivered straight to the registered receiver. Outbound substreams are
/// requested by the behavior and returned to the caller through the reply channel.
pub struct StreamHandler {
    /// The remote peer.
    peer: PeerId,
    /// Registrations shared with the behavior and every other connection.
    inbound: Arc<Mutex<InboundProtocols>>,
    /// Outbound requests not yet handed to the connection.
    pending_outbound: VecDeque<(u64, StreamProtocol, StreamReply)>,
    /// Outbound requests being negotiated.
    in_flight: HashMap<u64, (StreamProtocol, StreamReply)>,
    /// Id for the next outbound request.
    next_request_id: u64,
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("peer", &self.peer)
            .field("pending_outbound_count", &self.pending_outbound.len())
            .field("in_flight_count", &self.in_flight.len())
            .finish()
    }
}

impl StreamHandler {
    /// Create a new stream handler.
    pub(crate) fn new(peer: PeerId, inbound: Arc<Mutex<InboundProtocols>>) -> Self {
        Self {
            peer,
            inbound,
            pending_outbound: VecDeque::new(),
            in_flight: HashMap::new(),
            next_request_id: 0,
        }
    }

    /// Resolve an outbound request.
    fn reply(&mut self, request_id: u64, result: NetworkResult<Stream>) {
        let Some((protocol, reply)) = self.in_flight.remove(&request_id) else {
            return;
        };

        if reply.send(result).is_err() {
            debug!(target: "helper-network", peer = ?self.peer, %protocol, "open stream caller gone");
        }
    }
}

impl ConnectionHandler for StreamHandler {
    type FromBehaviour = HandlerCommand;
    type ToBehaviour = Infallible;
    type InboundProtocol = HelperStreamProtocol;
    type OutboundProtocol = HelperStreamProtocol;
    type InboundOpenInfo = ();
    type OutboundOpenInfo = u64;

    fn listen_protocol(&self) -> SubstreamProtocol<Self::InboundProtocol, Self::InboundOpenInfo> {
        let supported = self.inbound.lock().supported();
        SubstreamProtocol::new(HelperStreamProtocol::new(supported), ())
    }

    fn on_behaviour_event(&mut self, event: Self::FromBehaviour) {
        match event {
            HandlerCommand::OpenStream { protocol, reply } => {
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                self.pending_outbound.push_back((request_id, protocol, reply));
            }
        }
    }

    fn on_connection_event(
        &mut self,
        event: ConnectionEvent<
            '_,
            Self::InboundProtocol,
            Self::OutboundProtocol,
            Self::InboundOpenInfo,
            Self::OutboundOpenInfo,
        >,
    ) {
        match event {
            ConnectionEvent::FullyNegotiatedInbound(FullyNegotiatedInbound {
                protocol: (stream, protocol),
                ..
            }) => {
                self.inbound.lock().deliver(self.peer, protocol, stream);
            }
            ConnectionEvent::FullyNegotiatedOutbound(FullyNegotiatedOutbound {
                protocol: (stream, _),
                info: request_id,
                ..
            }) => {
                self.reply(request_id, Ok(stream));
            }
            ConnectionEvent::DialUpgradeError(DialUpgradeError { info: request_id, error }) => {
                let Some(protocol) = self.in_flight.get(&request_id).map(|(p, _)| p.clone())
                else {
                    return;
                };

                let error = match error {
                    StreamUpgradeError::NegotiationFailed => {
                        NetworkError::UnsupportedProtocol(protocol)
                    }
                    StreamUpgradeError::Timeout => {
                        NetworkError::Io(io::ErrorKind::TimedOut.into())
                    }
                    StreamUpgradeError::Io(e) => NetworkError::Io(e),
                    StreamUpgradeError::Apply(never) => match never {},
                };
                self.reply(request_id, Err(error));
            }
            _ => {}
        }
    }

    fn connection_keep_alive(&self) -> bool {
        !self.pending_outbound.is_empty() || !self.in_flight.is_empty()
    }

    fn poll(
        &mut self,
        _cx: &mut Context<'_>,
    ) -> Poll<
        ConnectionHandlerEvent<Self::OutboundProtocol, Self::OutboundOpenInfo, Self::ToBehaviour>,
    > {
        // request outbound streams
        if let Some((request_id, protocol, reply)) = self.pending_outbound.pop_front() {
            self.in_flight.insert(request_id, (protocol.clone(), reply));
            return Poll::Ready(ConnectionHandlerEvent::OutboundSubstreamRequest {
                protocol: SubstreamProtocol::new(
                    HelperStreamProtocol::new(vec![protocol]),
                    request_id,
                ),
            });
        }

        Poll::Pending
    }
}
