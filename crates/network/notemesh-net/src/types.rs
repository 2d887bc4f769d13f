//! Core types for negotiation and relay traffic.

use notemesh_replica::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// SDP type carried in a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate in its browser JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate line without media section hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Opaque negotiation envelope forwarded by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

/// Frames sent from a node to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Register { id: NodeId },
    Signal { to: NodeId, signal: SignalPayload },
}

/// Frames sent from the relay to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
    PeerList { ids: Vec<NodeId> },
    PeerJoined { id: NodeId },
    PeerLeft { id: NodeId },
    Signal { from: NodeId, signal: SignalPayload },
}

/// Identifies one physical link attempt; a retry or restart gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(u64);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

impl LinkId {
    /// Allocate a process-unique link id
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id parsed back from an SDP token
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Aggregate state of the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What a link reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A local ICE candidate to be signaled to the remote
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(String),
    StateChanged(LinkState),
}

/// Event raised by a link on behalf of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub peer: NodeId,
    pub link: LinkId,
    pub kind: TransportEventKind,
}

/// Everything that can wake a node's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Relay(RelayEvent),
    Transport(TransportEvent),
    /// Result of a negotiation step run off the event loop
    Negotiation(crate::coordinator::NegotiationEvent),
    /// Scheduled reconnect attempt
    Retry(NodeId),
}

/// Sender half feeding a node's event loop.
pub type EventSender = mpsc::UnboundedSender<NodeEvent>;

/// Receiver half drained by a node's event loop.
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// Create a node event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
