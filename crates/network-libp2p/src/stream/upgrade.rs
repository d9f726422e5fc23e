//! Protocol negotiation for application streams.

use futures::future::{ready, Ready};
use libp2p::{core::UpgradeInfo, InboundUpgrade, OutboundUpgrade, Stream, StreamProtocol};
use std::convert::Infallible;

/// Negotiates one of a set of application protocols and hands back the raw stream.
///
/// Inbound upgrades offer every protocol with a live handler. Outbound upgrades propose exactly
/// the protocol the caller asked for.
#[derive(Debug, Clone)]
pub struct HelperStreamProtocol {
    /// Protocols offered during multistream-select.
    protocols: Vec<StreamProtocol>,
}

impl HelperStreamProtocol {
    /// Create a new instance of Self.
    pub(crate) fn new(protocols: Vec<StreamProtocol>) -> Self {
        Self { protocols }
    }
}

impl UpgradeInfo for HelperStreamProtocol {
    type Info = StreamProtocol;
    type InfoIter = std::vec::IntoIter<Self::Info>;

    fn protocol_info(&self) -> Self::InfoIter {
        self.protocols.clone().into_iter()
    }
}

impl InboundUpgrade<Stream> for HelperStreamProtocol {
    type Output = (Stream, StreamProtocol);
    type Error = Infallible;
    type Future = Ready<Result<Self::Output, Self::Error>>;

    fn upgrade_inbound(self, stream: Stream, protocol: Self::Info) -> Self::Future {
        ready(Ok((stream, protocol)))
    }
}

impl OutboundUpgrade<Stream> for HelperStreamProtocol {
    type Output = (Stream, StreamProtocol);
    type Error = Infallible;
    type Future = Ready<Result<Self::Output, Self::Error>>;

    fn upgrade_outbound(self, stream: Stream, protocol: Self::Info) -> Self::Future {
        ready(Ok((stream, protocol)))
    }
}
