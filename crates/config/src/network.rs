//! Configuration for network variables.

use libp2p::{multiaddr::Protocol, Multiaddr};
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

/// The container for all network configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// The multiaddrs the swarm listens on.
    pub listen_addrs: Vec<Multiaddr>,
    /// Peers dialed once the network task starts.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Location of the protobuf-encoded libp2p keypair.
    ///
    /// A new ed25519 keypair is generated and written here if the file does not exist.
    /// If `None`, a fresh identity is used for every run.
    pub keypair_path: Option<PathBuf>,
    /// How long a connection without active streams is kept open.
    #[serde(with = "humantime_serde")]
    pub idle_connection_timeout: Duration,
    /// Upper bound for dialing, negotiating and opening an outbound stream.
    #[serde(with = "humantime_serde")]
    pub open_stream_timeout: Duration,
    /// The protocol version advertised through identify.
    pub identify_protocol_version: String,
    /// Capacity of the channel between network handles and the swarm task.
    pub command_channel_capacity: usize,
}

impl NetworkConfig {
    /// Return the timeout applied to every outbound stream.
    pub fn open_stream_timeout(&self) -> Duration {
        self.open_stream_timeout
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            // all interfaces, OS-assigned port
            listen_addrs: vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                .with(Protocol::Tcp(0))],
            bootstrap_peers: Vec::new(),
            keypair_path: None,
            idle_connection_timeout: Duration::from_secs(60),
            open_stream_timeout: Duration::from_secs(10),
            identify_protocol_version: "/libp2p-helper/1.0.0".to_string(),
            command_channel_capacity: 100,
        }
    }
}
