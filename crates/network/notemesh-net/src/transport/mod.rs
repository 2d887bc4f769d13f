//! Transport layer abstractions and implementations.
//!
//! The coordinator talks to peers only through [`PeerTransport`] and
//! [`PeerLink`]. [`WebRtcTransport`] drives real peer connections;
//! [`MemoryNetwork`] emulates relay and links in-process for tests.

pub mod memory;
pub mod traits;
pub mod webrtc;

pub use memory::{MemoryLink, MemoryNetwork, MemoryRelay, MemoryTransport};
pub use traits::{PeerLink, PeerTransport, SignalingLink};
pub use webrtc::{WebRtcLink, WebRtcTransport};
