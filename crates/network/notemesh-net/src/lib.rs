//! # Notemesh-Net
//!
//! Peer-to-peer layer of a replicated note collection.
//!
//! Nodes find each other through a signaling relay, negotiate exactly one
//! data channel per peer, reconcile their replicas on open and disseminate
//! every later mutation to their peers.
//!
//! ## Architecture
//!
//! - **Signaling**: [`RelayClient`] talks to a dumb forwarding [`RelayServer`]
//! - **Negotiation**: [`PeerConnectionCoordinator`] handles glare, candidate
//!   buffering and bounded retries behind the [`PeerTransport`] seam; each
//!   session's SDP and signaling I/O runs on its own driver task
//! - **Synchronization**: [`SyncProtocol`] exchanges full state on open with an
//!   anti-loop marker and applies incremental events
//! - **Dissemination**: [`BroadcastManager`] runs one of five swappable policies
//! - **Node**: [`Node`] owns all of the above plus the replica and persistence,
//!   and [`spawn`] runs it as a single actor behind a [`NodeHandle`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use notemesh_net::{event_channel, spawn, MemoryNetwork, Node, NodeConfig};
//! use notemesh_replica::{MemorySnapshotStore, NodeId};
//! use std::sync::Arc;
//!
//! # async fn run() -> notemesh_net::Result<()> {
//! let network = MemoryNetwork::new();
//! let id = NodeId::from("node_a");
//! let (events_tx, events_rx) = event_channel();
//! let (relay, transport) = network.join(&id, events_tx.clone());
//!
//! let node = Node::new(
//!     NodeConfig::default(),
//!     id,
//!     transport,
//!     relay,
//!     events_tx,
//!     Arc::new(MemorySnapshotStore::new()),
//! )?;
//! let handle = spawn(node, events_rx);
//! handle.create_note("Groceries", "milk").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod dissemination;
pub mod error;
pub mod node;
pub mod protocol;
pub mod signaling;
pub mod sync;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{DisseminationConfig, NegotiationConfig, NodeConfig, SyncConfig, WebRtcConfig};
pub use coordinator::{
    CoordinatorStats, LinkNotice, NegotiationEvent, NegotiationPhase, PeerChannel, PeerConnectionCoordinator, PeerEvent,
    PeerStatus,
};
pub use dissemination::{
    BroadcastManager, BroadcastOptions, BroadcastPolicyKind, BroadcastReport, BroadcastStats, DisseminationPolicy,
    PeerSelector,
};
pub use error::{ErrorSeverity, NetworkError, Result, TransportError};
pub use node::{spawn, MutationOutcome, Node, NodeHandle, NodeStats};
pub use protocol::{Envelope, StrategyConfig, StrategyType, WireMessage};
pub use signaling::{RelayClient, RelayServer};
pub use sync::{SyncProtocol, SyncStats};
pub use transport::{MemoryNetwork, PeerLink, PeerTransport, SignalingLink, WebRtcTransport};
pub use types::{event_channel, EventReceiver, EventSender, IceCandidate, LinkId, NodeEvent, RelayEvent, SignalPayload};
