//! Peer-to-peer host for the helper process built using libp2p.
//!
//! [HelperNetwork] owns the swarm and runs on its own task. Everything else talks to it through a
//! cloneable [NetworkHandle], which implements [Host].

pub mod error;
mod host;
mod keypair;
mod network;
mod peers;
mod stream;
pub mod types;

pub use error::{NetworkError, NetworkResult};
pub use host::{Host, PeerInfo};
pub use keypair::load_or_generate_keypair;
pub use network::{dial_bootstrap_peers, HelperBehaviour, HelperNetwork};
pub use stream::{IncomingStreams, StreamBehavior, StreamControl};
pub use types::NetworkHandle;

// re-export types from libp2p used across the helper
pub use libp2p::{multiaddr::Protocol, Multiaddr, PeerId, StreamProtocol};
