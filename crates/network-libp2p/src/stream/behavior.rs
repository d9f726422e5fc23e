//! Network behavior for application streams registered at runtime.

use super::{
    handler::{HandlerCommand, StreamHandler, StreamReply},
    inbound::InboundProtocols,
    StreamControl,
};
use crate::error::NetworkError;
use futures::{channel::mpsc, StreamExt as _};
use libp2p::{
    core::{transport::PortUse, Endpoint},
    swarm::{
        behaviour::{ConnectionClosed, ConnectionEstablished, DialFailure},
        dial_opts::{DialOpts, PeerCondition},
        ConnectionDenied, ConnectionId, DialError, FromSwarm, NetworkBehaviour, NotifyHandler,
        THandler, THandlerInEvent, THandlerOutEvent, ToSwarm,
    },
    Multiaddr, PeerId, StreamProtocol,
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

/// Commands from [StreamControl] to behavior.
#[derive(Debug)]
pub enum StreamCommand {
    /// Open an outbound stream to a peer, dialing it first if needed.
    OpenStream {
        /// The peer to open the stream to.
        peer: PeerId,
        /// The protocol to propose.
        protocol: StreamProtocol,
        /// Channel for the negotiated stream.
        reply: StreamReply,
    },
}

/// The network behavior for application streams.
///
/// Outbound requests are routed to a connection handler for the peer. Peers without a
/// connection are dialed and their requests wait for the connection. Inbound registrations live
/// in [InboundProtocols], shared with every handler.
pub struct StreamBehavior {
    /// Inbound registrations.
    inbound: Arc<Mutex<InboundProtocols>>,
    /// Sender cloned into every [StreamControl].
    commands_tx: mpsc::UnboundedSender<StreamCommand>,
    /// Commands from controls.
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    /// Established connections per peer.
    connections: HashMap<PeerId, Vec<ConnectionId>>,
    /// Requests waiting for a connection to the peer.
    awaiting_connection: HashMap<PeerId, Vec<(StreamProtocol, StreamReply)>>,
    /// Events to emit to the swarm.
    events: VecDeque<ToSwarm<Infallible, HandlerCommand>>,
}

impl std::fmt::Debug for StreamBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBehavior")
            .field("connected_peers", &self.connections.len())
            .field("awaiting_connection", &self.awaiting_connection.len())
            .field("events_count", &self.events.len())
            .finish()
    }
}

impl StreamBehavior {
    /// Create a new stream behavior.
    pub fn new() -> Self {
        let (commands_tx, commands) = mpsc::unbounded();
        Self {
            inbound: Default::default(),
            commands_tx,
            commands,
            connections: HashMap::new(),
            awaiting_connection: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Create a control to open and accept streams from outside the swarm task.
    pub fn new_control(&self) -> StreamControl {
        StreamControl::new(self.inbound.clone(), self.commands_tx.clone())
    }

    /// Route an outbound request to a connection, or dial the peer.
    fn open_stream(&mut self, peer: PeerId, protocol: StreamProtocol, reply: StreamReply) {
        if let Some(connection) = self.connections.get(&peer).and_then(|c| c.first()) {
            self.events.push_back(ToSwarm::NotifyHandler {
                peer_id: peer,
                handler: NotifyHandler::One(*connection),
                event: HandlerCommand::OpenStream { protocol, reply },
            });
            return;
        }

        debug!(target: "helper-network", ?peer, %protocol, "dialing peer for outbound stream");
        self.awaiting_connection.entry(peer).or_default().push((protocol, reply));
        self.events.push_back(ToSwarm::Dial {
            opts: DialOpts::peer_id(peer).condition(PeerCondition::DisconnectedAndNotDialing).build(),
        });
    }

    /// Hand requests waiting on the peer to a new connection.
    fn on_connection_established(&mut self, peer: PeerId, connection: ConnectionId) {
        self.connections.entry(peer).or_default().push(connection);
        for (protocol, reply) in self.awaiting_connection.remove(&peer).unwrap_or_default() {
            self.events.push_back(ToSwarm::NotifyHandler {
                peer_id: peer,
                handler: NotifyHandler::One(connection),
                event: HandlerCommand::OpenStream { protocol, reply },
            });
        }
    }

    fn on_connection_closed(&mut self, peer: PeerId, connection: ConnectionId) {
        if let Some(connections) = self.connections.get_mut(&peer) {
            connections.retain(|c| *c != connection);
            if connections.is_empty() {
                self.connections.remove(&peer);
            }
        }
    }

    /// Fail requests waiting on a peer that could not be dialed.
    fn on_dial_failure(&mut self, peer: PeerId, error: &DialError) {
        // another dial to the peer is in progress or already succeeded
        if matches!(error, DialError::DialPeerConditionFalse(_)) {
            return;
        }

        for (protocol, reply) in self.awaiting_connection.remove(&peer).unwrap_or_default() {
            debug!(target: "helper-network", ?peer, %protocol, %error, "outbound stream dial failed");
            let error = io::Error::new(io::ErrorKind::NotConnected, error.to_string());
            if reply.send(Err(NetworkError::Io(error))).is_err() {
                debug!(target: "helper-network", ?peer, "open stream caller gone");
            }
        }
    }
}

impl Default for StreamBehavior {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkBehaviour for StreamBehavior {
    type ConnectionHandler = StreamHandler;
    type ToSwarm = Infallible;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(StreamHandler::new(peer, self.inbound.clone()))
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        Ok(StreamHandler::new(peer, self.inbound.clone()))
    }

    fn on_swarm_event(&mut self, event: FromSwarm<'_>) {
        match event {
            FromSwarm::ConnectionEstablished(ConnectionEstablished {
                peer_id,
                connection_id,
                ..
            }) => self.on_connection_established(peer_id, connection_id),
            FromSwarm::ConnectionClosed(ConnectionClosed { peer_id, connection_id, .. }) => {
                self.on_connection_closed(peer_id, connection_id)
            }
            FromSwarm::DialFailure(DialFailure { peer_id: Some(peer_id), error, .. }) => {
                self.on_dial_failure(peer_id, error)
            }
            _ => {}
        }
    }

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        while let Poll::Ready(Some(command)) = self.commands.poll_next_unpin(cx) {
            match command {
                StreamCommand::OpenStream { peer, protocol, reply } => {
                    self.open_stream(peer, protocol, reply)
                }
            }
        }

        if let Some(event) = self.events.pop_front() {
            return Poll::Ready(event);
        }

        Poll::Pending
    }
}
