//! Error types for the sync layer.

use pantry_core::{ConflictResolutionError, RegressionError, StoreError};

use crate::framing::FrameError;
use crate::protocol::ProtocolError;
use crate::token::ConnectToken;

/// Data channel failures. Recoverable: surfaced as a connection state change.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    ConnectionClosed,
    DialFailed(String),
    Io(String),
    WebSocket(String),
    /// Unknown or unsupported endpoint for this transport
    BadEndpoint(String),
    /// No traffic for longer than the liveness timeout
    LivenessTimeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::DialFailed(e) => write!(f, "Dial failed: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::BadEndpoint(e) => write!(f, "Bad endpoint: {e}"),
            Self::LivenessTimeout => write!(f, "Liveness timeout"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

/// Signaling failures.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingError {
    /// Nobody is registered under the token
    UnknownPeer(ConnectToken),
    ChannelClosed,
    Encoding(String),
    Connect(String),
}

impl std::fmt::Display for SignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPeer(token) => write!(f, "Unknown peer: {token}"),
            Self::ChannelClosed => write!(f, "Signaling channel closed"),
            Self::Encoding(e) => write!(f, "Signaling encoding error: {e}"),
            Self::Connect(e) => write!(f, "Signaling connect failed: {e}"),
        }
    }
}

impl std::error::Error for SignalingError {}

/// Umbrella error for the sync crate.
#[derive(Debug, Clone)]
pub enum SyncError {
    Transport(TransportError),
    Protocol(ProtocolError),
    /// Version cursor would move backwards
    Regression(RegressionError),
    /// Peer schema does not match ours
    Conflict(ConflictResolutionError),
    Store(StoreError),
    Signaling(SignalingError),
    InvalidToken(String),
    /// The peer manager has shut down
    Closed,
}

impl SyncError {
    /// Whether this error ends the pairing with the peer for good (no retry).
    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Regression(_) | Self::Conflict(_) | Self::Store(_)
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Regression(e) => write!(f, "{e}"),
            Self::Conflict(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Signaling(e) => write!(f, "{e}"),
            Self::InvalidToken(e) => write!(f, "Invalid connect token: {e}"),
            Self::Closed => write!(f, "Peer manager closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<FrameError> for SyncError {
    fn from(e: FrameError) -> Self {
        Self::Protocol(ProtocolError::Framing(e))
    }
}

impl From<SignalingError> for SyncError {
    fn from(e: SignalingError) -> Self {
        Self::Signaling(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Regression(e) => Self::Regression(e),
            StoreError::Conflict(e) => Self::Conflict(e),
            other => Self::Store(other),
        }
    }
}
