//! The helper's libp2p swarm and the task that drives it.

use crate::{
    error::{NetworkError, NetworkResult},
    host::PeerInfo,
    peers::{AddressSource, KnownPeers},
    stream::{StreamBehavior, StreamControl},
    types::{NetworkCommand, NetworkHandle},
};
use futures::StreamExt as _;
use libp2p::{
    core::ConnectedPoint,
    identify, identity, noise,
    swarm::{dial_opts::DialOpts, ConnectionId, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use lh_config::NetworkConfig;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// The network behaviour for the helper.
///
/// Identify learns the listen addresses of connected peers. The stream behaviour negotiates
/// application protocols registered at runtime.
#[derive(NetworkBehaviour)]
pub struct HelperBehaviour {
    /// Exchange listen addresses and protocols with connected peers.
    identify: identify::Behaviour,
    /// Raw streams for dynamically registered protocols.
    stream: StreamBehavior,
}

impl HelperBehaviour {
    /// Create a new instance of Self.
    fn new(keypair: &identity::Keypair, config: &NetworkConfig) -> Self {
        let identify = identify::Behaviour::new(identify::Config::new(
            config.identify_protocol_version.clone(),
            keypair.public(),
        ));
        Self { identify, stream: StreamBehavior::new() }
    }
}

/// The libp2p host for the helper.
///
/// Owns the swarm and processes [NetworkCommand]s from [NetworkHandle]s until every handle is
/// dropped.
pub struct HelperNetwork {
    /// The swarm.
    swarm: Swarm<HelperBehaviour>,
    /// The sender for network handles.
    ///
    /// Taken when the network starts running so the loop ends once all handles are dropped.
    handle: Option<mpsc::Sender<NetworkCommand>>,
    /// The receiver for processing network handle requests.
    commands: mpsc::Receiver<NetworkCommand>,
    /// Stream control shared with handles.
    control: StreamControl,
    /// Addresses known for peers.
    peers: KnownPeers,
    /// Dials waiting for the connection to be established.
    pending_dials: HashMap<ConnectionId, oneshot::Sender<NetworkResult<PeerId>>>,
}

impl HelperNetwork {
    /// Create the swarm and start listening on all configured addresses.
    pub fn new(config: &NetworkConfig, keypair: identity::Keypair) -> eyre::Result<Self> {
        let behaviour = HelperBehaviour::new(&keypair, config);
        let idle_timeout = config.idle_connection_timeout;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            // tokio runtime
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_behaviour(|_| behaviour)?
            .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
            .build();

        for addr in &config.listen_addrs {
            swarm.listen_on(addr.clone()).map_err(NetworkError::from)?;
        }

        let control = swarm.behaviour().stream.new_control();
        let (handle, commands) = mpsc::channel(config.command_channel_capacity);
        info!(target: "helper-network", peer_id = %swarm.local_peer_id(), "network created");

        Ok(Self {
            swarm,
            handle: Some(handle),
            commands,
            control,
            peers: KnownPeers::default(),
            pending_dials: HashMap::new(),
        })
    }

    /// Return a [NetworkHandle] to send commands to this network.
    ///
    /// Handles must be created before the network starts running.
    pub fn network_handle(&self) -> Option<NetworkHandle> {
        self.handle.as_ref().map(|sender| {
            NetworkHandle::new(sender.clone(), self.control.clone(), *self.swarm.local_peer_id())
        })
    }

    /// This node's peer id.
    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Run the network loop to process incoming swarm events and commands.
    ///
    /// Returns once every [NetworkHandle] has been dropped.
    pub async fn run(mut self) -> NetworkResult<()> {
        self.handle.take();

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.process_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.process_command(command),
                    None => {
                        info!(target: "helper-network", "all network handles dropped, shutting down");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Process events from the swarm.
    fn process_swarm_event(&mut self, event: SwarmEvent<HelperBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(target: "helper-network", %address, "listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, connection_id, endpoint, .. } => {
                debug!(target: "helper-network", ?peer_id, ?endpoint, "connection established");
                if let ConnectedPoint::Dialer { address, .. } = endpoint {
                    if self.peers.insert(peer_id, address.clone(), AddressSource::Dialed) {
                        self.swarm.add_peer_address(peer_id, address);
                    }
                }

                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    if reply.send(Ok(peer_id)).is_err() {
                        warn!(target: "helper-network", ?peer_id, "dial reply dropped");
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { connection_id, peer_id, error } => {
                debug!(target: "helper-network", ?peer_id, %error, "outgoing connection failed");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    if reply.send(Err(error.into())).is_err() {
                        warn!(target: "helper-network", ?peer_id, "dial reply dropped");
                    }
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, num_established, .. } => {
                debug!(target: "helper-network", ?peer_id, ?cause, num_established, "connection closed");
                if num_established == 0 {
                    self.peers.disconnected(&peer_id);
                }
            }
            SwarmEvent::Behaviour(HelperBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                trace!(target: "helper-network", ?peer_id, listen_addrs = ?info.listen_addrs, "identify received");
                for addr in info.listen_addrs {
                    if self.peers.insert(peer_id, addr.clone(), AddressSource::Identify) {
                        self.swarm.add_peer_address(peer_id, addr);
                    }
                }
            }
            _ => {}
        }
    }

    /// Process commands from network handles.
    fn process_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::GetListener { reply } => {
                let addrs = self.swarm.listeners().cloned().collect();
                if let Err(e) = reply.send(addrs) {
                    error!(target: "helper-network", ?e, "GetListeners command failed");
                }
            }
            NetworkCommand::Dial { addr, reply } => {
                let dial_opts = DialOpts::unknown_peer_id().address(addr).build();
                let connection_id = dial_opts.connection_id();
                match self.swarm.dial(dial_opts) {
                    Ok(()) => {
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(e) => {
                        if reply.send(Err(e.into())).is_err() {
                            warn!(target: "helper-network", "dial reply dropped");
                        }
                    }
                }
            }
            NetworkCommand::PeerInfo { peer_id, reply } => {
                let info = self.peer_info(peer_id);
                if let Err(e) = reply.send(info) {
                    error!(target: "helper-network", ?e, "PeerInfo command failed");
                }
            }
            NetworkCommand::ConnectedPeers { reply } => {
                let connected: Vec<PeerId> = self.swarm.connected_peers().copied().collect();
                let peers = connected.into_iter().map(|peer_id| self.peer_info(peer_id)).collect();
                if let Err(e) = reply.send(peers) {
                    error!(target: "helper-network", ?e, "ConnectedPeers command failed");
                }
            }
        }
    }

    /// The current [PeerInfo] for a peer.
    fn peer_info(&self, peer_id: PeerId) -> PeerInfo {
        PeerInfo::new(peer_id, self.peers.addresses(&peer_id))
    }
}

/// Convenience method for dialing the configured bootstrap peers.
///
/// Failures are logged and otherwise ignored: a helper without reachable bootstrap peers still
/// serves RPC requests.
pub async fn dial_bootstrap_peers(handle: &NetworkHandle, peers: &[Multiaddr]) {
    for addr in peers {
        match handle.dial(addr.clone()).await {
            Ok(peer_id) => info!(target: "helper-network", %addr, ?peer_id, "connected to bootstrap peer"),
            Err(e) => warn!(target: "helper-network", %addr, %e, "failed to dial bootstrap peer"),
        }
    }
}

#[cfg(test)]
#[path = "tests/network_tests.rs"]
mod network_tests;
