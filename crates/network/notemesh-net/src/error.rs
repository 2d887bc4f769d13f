//! Error types for the networking layer.

use notemesh_replica::{NodeId, ReplicaError, StorageError};
use std::fmt;
use thiserror::Error;

/// Type alias for Results in this crate.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Main error type for networking operations.
///
/// None of these are fatal to a node: each one abandons a single negotiation
/// attempt, message or snapshot and the node keeps serving remaining peers.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// SDP or ICE step failed; the attempt is abandoned
    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: NodeId, reason: String },

    /// Data-channel payload could not be decoded
    #[error("Malformed message from {peer}: {reason}")]
    MessageParse { peer: NodeId, reason: String },

    /// Signal or message for a peer with no local session
    #[error("No session for peer {0}")]
    UnknownPeer(NodeId),

    /// Replica errors
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Transport-specific errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Signaling failed: {0}")]
    SignalingFailed(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl NetworkError {
    /// Shorthand for a negotiation failure
    pub fn negotiation(peer: &NodeId, reason: impl fmt::Display) -> Self {
        NetworkError::Negotiation {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    /// Returns the severity of this error for logging purposes.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            NetworkError::Configuration(_) => ErrorSeverity::Critical,
            NetworkError::Io(_) => ErrorSeverity::Critical,
            NetworkError::Transport(_) => ErrorSeverity::Major,
            NetworkError::Negotiation { .. } => ErrorSeverity::Major,
            NetworkError::Storage(_) => ErrorSeverity::Major,
            NetworkError::Replica(_) => ErrorSeverity::Major,
            NetworkError::Other(_) => ErrorSeverity::Major,
            NetworkError::MessageParse { .. } => ErrorSeverity::Minor,
            NetworkError::UnknownPeer(_) => ErrorSeverity::Minor,
            NetworkError::Protocol(_) => ErrorSeverity::Minor,
        }
    }

    /// Returns a short error category for structured log fields.
    pub fn observable_type(&self) -> &'static str {
        match self {
            NetworkError::Transport(_) => "transport",
            NetworkError::Negotiation { .. } => "negotiation",
            NetworkError::MessageParse { .. } => "message_parse",
            NetworkError::UnknownPeer(_) => "unknown_peer",
            NetworkError::Replica(_) => "replica",
            NetworkError::Storage(_) => "storage",
            NetworkError::Configuration(_) => "configuration",
            NetworkError::Protocol(_) => "protocol",
            NetworkError::Io(_) => "io",
            NetworkError::Other(_) => "other",
        }
    }

    /// Log this error at the level matching its severity.
    pub fn report(&self, context: &str) {
        let kind = self.observable_type();
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::Major => {
                tracing::error!(kind, error = %self, "{context}")
            }
            ErrorSeverity::Minor => tracing::warn!(kind, error = %self, "{context}"),
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Errors that leave the node unable to operate as configured
    Critical,
    /// Errors that cost a peer link, a snapshot or a negotiation attempt
    Major,
    /// Errors that cost a single message or signal
    Minor,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "critical"),
            ErrorSeverity::Major => write!(f, "major"),
            ErrorSeverity::Minor => write!(f, "minor"),
        }
    }
}

impl From<webrtc::Error> for NetworkError {
    fn from(err: webrtc::Error) -> Self {
        NetworkError::Transport(TransportError::WebRtc(err.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::Transport(TransportError::WebSocket(err.to_string()))
    }
}
