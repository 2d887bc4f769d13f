//! Transport traits and abstractions.

use crate::error::Result;
use crate::types::{EventSender, IceCandidate, LinkId, SessionDescription, SignalPayload};
use async_trait::async_trait;
use notemesh_replica::NodeId;
use std::sync::Arc;

/// Factory for peer links.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates a fresh link towards `remote`.
    ///
    /// The link reports candidates, channel lifecycle and messages as
    /// [`crate::types::TransportEvent`]s tagged with its [`LinkId`].
    async fn open_link(&self, remote: &NodeId, events: EventSender) -> Result<Arc<dyn PeerLink>>;

    /// Name of this transport for logging.
    fn name(&self) -> &'static str;
}

/// One negotiation attempt with a remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Returns the id tagging this link's events.
    fn id(&self) -> LinkId;

    /// Creates the outbound data channel; only the offering side calls this.
    async fn create_data_channel(&self) -> Result<()>;

    /// Builds an offer and sets it as the local description.
    async fn create_offer(&self) -> Result<String>;

    /// Builds an answer and sets it as the local description.
    async fn create_answer(&self) -> Result<String>;

    /// Applies the remote offer or answer.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Applies one remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Checks if the data channel is open.
    fn is_channel_open(&self) -> bool;

    /// Enqueues a text frame on the data channel without waiting for delivery.
    fn send(&self, frame: &str) -> Result<()>;

    /// Closes the channel and connection.
    async fn close(&self) -> Result<()>;
}

/// Outbound side of the signaling relay.
#[async_trait]
pub trait SignalingLink: Send + Sync {
    /// Sends a negotiation envelope to `to` through the relay.
    async fn send_signal(&self, to: &NodeId, signal: SignalPayload) -> Result<()>;
}
