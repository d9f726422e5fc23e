//! Address book for peers this node has seen.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use std::collections::HashMap;

/// Where an address for a peer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressSource {
    /// This node dialed the address and the connection succeeded.
    Dialed,
    /// The peer reported the address as one of its listeners through identify.
    Identify,
}

/// The addresses known for every peer.
///
/// Addresses are kept without their trailing `/p2p/<peer id>` component. Dialed addresses are
/// ordered before identify addresses because they are known to be reachable from this node.
/// Identify addresses are only kept while the peer is connected.
#[derive(Debug, Default)]
pub(crate) struct KnownPeers {
    /// Addresses by peer.
    addresses: HashMap<PeerId, Vec<(Multiaddr, AddressSource)>>,
}

impl KnownPeers {
    /// Record an address for a peer and return true if it was not known yet.
    pub(crate) fn insert(&mut self, peer_id: PeerId, addr: Multiaddr, source: AddressSource) -> bool {
        let addr = strip_peer_id(addr);
        let known = self.addresses.entry(peer_id).or_default();

        if let Some(position) = known.iter().position(|(a, _)| *a == addr) {
            // a dialed address stays reachable after the peer disconnects
            if source == AddressSource::Dialed && known[position].1 == AddressSource::Identify {
                known.remove(position);
                known.insert(0, (addr, source));
            }
            return false;
        }

        match source {
            AddressSource::Dialed => known.insert(0, (addr, source)),
            AddressSource::Identify => known.push((addr, source)),
        }

        true
    }

    /// Forget the identify addresses of a peer with no remaining connections.
    ///
    /// The peer is dropped entirely once it has no addresses left.
    pub(crate) fn disconnected(&mut self, peer_id: &PeerId) {
        if let Some(known) = self.addresses.get_mut(peer_id) {
            known.retain(|(_, source)| *source == AddressSource::Dialed);
            if known.is_empty() {
                self.addresses.remove(peer_id);
            }
        }
    }

    /// Return the known addresses for a peer.
    ///
    /// Unknown peers have no addresses.
    pub(crate) fn addresses(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
        self.addresses
            .get(peer_id)
            .map(|known| known.iter().map(|(addr, _)| addr.clone()).collect())
            .unwrap_or_default()
    }
}

/// Remove a trailing `/p2p/<peer id>` component.
fn strip_peer_id(mut addr: Multiaddr) -> Multiaddr {
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr
}
