//! Error types for the helper's libp2p host.

use libp2p::{swarm::DialError, StreamProtocol, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// The result for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Networking error type.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Swarm error dialing a peer.
    #[error(transparent)]
    Dial(#[from] DialError),
    /// Swarm error listening on an address.
    #[error(transparent)]
    Listen(#[from] TransportError<std::io::Error>),
    /// The remote peer did not accept any of the proposed protocols.
    #[error("protocol not supported: {0}")]
    UnsupportedProtocol(StreamProtocol),
    /// IO failure while negotiating or using a stream.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// An inbound handler for the protocol is still registered with the host.
    #[error("protocol handler already registered: {0}")]
    AlreadyRegistered(StreamProtocol),
    /// mpsc receiver dropped.
    #[error("mpsc error: {0}")]
    MpscSender(String),
    /// oneshot sender dropped.
    #[error("oneshot error: {0}")]
    AckChannelClosed(String),
}

impl From<oneshot::error::RecvError> for NetworkError {
    fn from(e: oneshot::error::RecvError) -> Self {
        Self::AckChannelClosed(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for NetworkError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        Self::MpscSender(e.to_string())
    }
}
