//! Errors returned to the client.
//!
//! Every failure an RPC operation can hit is converted into a [HelperError]; its display text is
//! the error string of the response.

use lh_network_libp2p::NetworkError;
use std::time::Duration;
use thiserror::Error;

/// The result for RPC operations.
pub type HelperResult<T> = Result<T, HelperError>;

/// Errors for RPC operations.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Close, reset or send on an id that is not registered.
    #[error("unknown stream id: {0}")]
    UnknownStreamId(u64),
    /// The remote peer has no handler for the requested protocol.
    #[error("libp2p error: protocol not supported")]
    ProtocolNotSupported,
    /// The peer could not be reached or the connection failed.
    #[error("libp2p error: {0}")]
    PeerUnreachable(String),
    /// Opening the stream did not finish in time.
    #[error("libp2p error: timed out after {0:?}")]
    DialTimeout(Duration),
    /// The request could not be decoded or a field is invalid.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// Reading or writing an open stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
    /// Any other host failure.
    #[error("libp2p error: {0}")]
    Host(NetworkError),
    /// The stream registry handed out an id that is already registered.
    ///
    /// This is an invariant violation and stops the helper.
    #[error("duplicate stream id: {0}")]
    DuplicateStreamId(u64),
}

impl HelperError {
    /// True if the helper cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DuplicateStreamId(_))
    }
}

impl From<NetworkError> for HelperError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::UnsupportedProtocol(_) => Self::ProtocolNotSupported,
            NetworkError::Timeout(duration) => Self::DialTimeout(duration),
            NetworkError::Dial(e) => Self::PeerUnreachable(e.to_string()),
            NetworkError::Io(e) => Self::PeerUnreachable(e.to_string()),
            e => Self::Host(e),
        }
    }
}
