//! In-memory relay and transport for testing and local communication.
//!
//! A [`MemoryNetwork`] plays both the signaling relay and the peer-to-peer
//! fabric. SDP is emulated with opaque tokens: an offer names the offering
//! link, an answer names both links, and applying the answer pairs them and
//! opens the data channel at both ends. Each local description produces one
//! local candidate, and remote candidates are only accepted once a remote
//! description is set, mirroring a real peer connection.

use crate::error::{NetworkError, Result, TransportError};
use crate::transport::traits::{PeerLink, PeerTransport, SignalingLink};
use crate::types::{
    EventSender, IceCandidate, LinkId, LinkState, NodeEvent, RelayEvent, SdpType,
    SessionDescription, SignalPayload, TransportEvent, TransportEventKind,
};
use async_trait::async_trait;
use notemesh_replica::NodeId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const OFFER_PREFIX: &str = "memory-offer";
const ANSWER_PREFIX: &str = "memory-answer";

/// State of one end of an emulated peer connection.
struct LinkSlot {
    owner: NodeId,
    remote: NodeId,
    events: EventSender,
    has_channel: bool,
    local_description: Option<SessionDescription>,
    /// Offering link named by the applied remote offer
    remote_offer: Option<LinkId>,
    remote_description_set: bool,
    partner: Option<LinkId>,
    open: bool,
    applied_candidates: Vec<IceCandidate>,
}

impl LinkSlot {
    fn emit(&self, link: LinkId, kind: TransportEventKind) {
        let event = NodeEvent::Transport(TransportEvent {
            peer: self.remote.clone(),
            link,
            kind,
        });
        if self.events.send(event).is_err() {
            debug!(owner = %self.owner, %link, "link event receiver dropped");
        }
    }
}

#[derive(Default)]
struct Hub {
    nodes: BTreeMap<NodeId, EventSender>,
    /// Slots of links not yet closed
    links: HashMap<LinkId, LinkSlot>,
}

/// Shared in-process relay and link fabric.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node with the relay.
    ///
    /// The joiner receives `peer-list` with every other node and the others
    /// receive `peer-joined`.
    pub fn join(&self, id: &NodeId, events: EventSender) -> (Arc<MemoryRelay>, Arc<MemoryTransport>) {
        let mut hub = self.hub.lock();
        let others: Vec<NodeId> = hub.nodes.keys().filter(|n| *n != id).cloned().collect();

        for tx in hub.nodes.values() {
            let _ = tx.send(NodeEvent::Relay(RelayEvent::PeerJoined { id: id.clone() }));
        }
        let _ = events.send(NodeEvent::Relay(RelayEvent::PeerList { ids: others }));
        hub.nodes.insert(id.clone(), events);
        info!(node = %id, "node joined memory relay");

        (
            Arc::new(MemoryRelay { id: id.clone(), network: self.clone() }),
            Arc::new(MemoryTransport { owner: id.clone(), network: self.clone() }),
        )
    }

    /// Unregisters a node and announces `peer-left` to the rest.
    pub fn leave(&self, id: &NodeId) {
        let mut hub = self.hub.lock();
        if hub.nodes.remove(id).is_none() {
            return;
        }
        for tx in hub.nodes.values() {
            let _ = tx.send(NodeEvent::Relay(RelayEvent::PeerLeft { id: id.clone() }));
        }
        info!(node = %id, "node left memory relay");
    }

    /// Reports a transport failure on the live link pair between two nodes.
    ///
    /// Both ends see `StateChanged(Failed)` and lose their channel. Returns
    /// false when no such pair exists.
    pub fn fail_link(&self, a: &NodeId, b: &NodeId) -> bool {
        let mut hub = self.hub.lock();
        let Some(id) = live_link(&hub, a, b) else {
            return false;
        };
        let partner = hub.links.get(&id).and_then(|slot| slot.partner);

        for link in std::iter::once(id).chain(partner) {
            if let Some(slot) = hub.links.get_mut(&link) {
                slot.open = false;
                slot.emit(link, TransportEventKind::StateChanged(LinkState::Failed));
            }
        }
        warn!(%a, %b, "injected link failure");
        true
    }

    /// Candidates applied so far to a link, in application order.
    pub fn applied_candidates(&self, link: LinkId) -> Vec<IceCandidate> {
        self.hub
            .lock()
            .links
            .get(&link)
            .map(|slot| slot.applied_candidates.clone())
            .unwrap_or_default()
    }

    /// Number of links owned by `owner` towards `remote` whose channel is open.
    pub fn open_channel_count(&self, owner: &NodeId, remote: &NodeId) -> usize {
        self.hub
            .lock()
            .links
            .values()
            .filter(|slot| &slot.owner == owner && &slot.remote == remote && slot.open)
            .count()
    }

    #[cfg(test)]
    fn live_slots(&self) -> usize {
        self.hub.lock().links.len()
    }

    fn with_slot<T>(&self, link: LinkId, f: impl FnOnce(&mut Hub) -> Result<T>) -> Result<T> {
        let mut hub = self.hub.lock();
        if !hub.links.contains_key(&link) {
            return Err(NetworkError::Transport(TransportError::NotConnected(format!("{link} is closed"))));
        }
        f(&mut hub)
    }
}

fn live_link(hub: &Hub, owner: &NodeId, remote: &NodeId) -> Option<LinkId> {
    hub.links
        .iter()
        .filter(|(_, slot)| &slot.owner == owner && &slot.remote == remote && slot.open)
        .map(|(id, _)| *id)
        .max()
}

fn local_candidate(link: LinkId, role: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:memory {} {role}", link.as_u64()),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

fn parse_link(token: Option<&str>) -> Option<LinkId> {
    token.and_then(|t| t.parse::<u64>().ok()).map(LinkId::from_raw)
}

/// Relay endpoint for one node.
pub struct MemoryRelay {
    id: NodeId,
    network: MemoryNetwork,
}

#[async_trait]
impl SignalingLink for MemoryRelay {
    async fn send_signal(&self, to: &NodeId, signal: SignalPayload) -> Result<()> {
        let hub = self.network.hub.lock();
        match hub.nodes.get(to) {
            Some(tx) => {
                let _ = tx.send(NodeEvent::Relay(RelayEvent::Signal {
                    from: self.id.clone(),
                    signal,
                }));
            }
            None => warn!(from = %self.id, %to, "relay target not registered, dropping signal"),
        }
        Ok(())
    }
}

/// Link factory for one node.
pub struct MemoryTransport {
    owner: NodeId,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn open_link(&self, remote: &NodeId, events: EventSender) -> Result<Arc<dyn PeerLink>> {
        let id = LinkId::next();
        self.network.hub.lock().links.insert(
            id,
            LinkSlot {
                owner: self.owner.clone(),
                remote: remote.clone(),
                events,
                has_channel: false,
                local_description: None,
                remote_offer: None,
                remote_description_set: false,
                partner: None,
                open: false,
                applied_candidates: Vec::new(),
            },
        );
        debug!(owner = %self.owner, %remote, link = %id, "opened memory link");

        Ok(Arc::new(MemoryLink {
            id,
            remote: remote.clone(),
            network: self.network.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One end of an emulated peer connection.
pub struct MemoryLink {
    id: LinkId,
    remote: NodeId,
    network: MemoryNetwork,
}

impl MemoryLink {
    fn negotiation_error(&self, reason: impl std::fmt::Display) -> NetworkError {
        NetworkError::negotiation(&self.remote, reason)
    }

    fn apply_offer(&self, hub: &mut Hub, sdp: &str) -> Result<()> {
        let mut parts = sdp.split_whitespace();
        let offer_link = match (parts.next(), parse_link(parts.next())) {
            (Some(OFFER_PREFIX), Some(link)) => link,
            _ => return Err(self.negotiation_error(format!("malformed offer sdp: {sdp:?}"))),
        };
        if let Some(slot) = hub.links.get_mut(&self.id) {
            slot.remote_offer = Some(offer_link);
            slot.remote_description_set = true;
        }
        Ok(())
    }

    fn apply_answer(&self, hub: &mut Hub, sdp: &str) -> Result<()> {
        let mut parts = sdp.split_whitespace();
        let (answer_link, offer_link) = match (parts.next(), parse_link(parts.next()), parse_link(parts.next())) {
            (Some(ANSWER_PREFIX), Some(answer), Some(offer)) => (answer, offer),
            _ => return Err(self.negotiation_error(format!("malformed answer sdp: {sdp:?}"))),
        };
        if offer_link != self.id {
            return Err(self.negotiation_error(format!("answer is for {offer_link}, not {}", self.id)));
        }

        let has_channel = match hub.links.get_mut(&self.id) {
            Some(slot) if matches!(slot.local_description, Some(ref d) if d.kind == SdpType::Offer) => {
                slot.remote_description_set = true;
                slot.partner = Some(answer_link);
                slot.has_channel
            }
            _ => return Err(self.negotiation_error("answer applied without a local offer")),
        };

        match hub.links.get_mut(&answer_link) {
            Some(partner) => partner.partner = Some(self.id),
            // Answerer went away in the meantime; nothing to connect to
            _ => return Ok(()),
        }

        for link in [self.id, answer_link] {
            if let Some(slot) = hub.links.get_mut(&link) {
                slot.emit(link, TransportEventKind::StateChanged(LinkState::Connected));
                if has_channel {
                    slot.open = true;
                    slot.emit(link, TransportEventKind::ChannelOpen);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    async fn create_data_channel(&self) -> Result<()> {
        self.network.with_slot(self.id, |hub| {
            if let Some(slot) = hub.links.get_mut(&self.id) {
                slot.has_channel = true;
            }
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<String> {
        self.network.with_slot(self.id, |hub| {
            let sdp = format!("{OFFER_PREFIX} {}", self.id.as_u64());
            if let Some(slot) = hub.links.get_mut(&self.id) {
                slot.local_description = Some(SessionDescription::offer(sdp.clone()));
                slot.emit(self.id, TransportEventKind::LocalCandidate(local_candidate(self.id, "offer")));
            }
            Ok(sdp)
        })
    }

    async fn create_answer(&self) -> Result<String> {
        self.network.with_slot(self.id, |hub| {
            let Some(slot) = hub.links.get_mut(&self.id) else {
                return Err(self.negotiation_error("link vanished"));
            };
            let Some(offer_link) = slot.remote_offer else {
                return Err(self.negotiation_error("cannot answer without a remote offer"));
            };
            let sdp = format!("{ANSWER_PREFIX} {} {}", self.id.as_u64(), offer_link.as_u64());
            slot.local_description = Some(SessionDescription::answer(sdp.clone()));
            slot.emit(self.id, TransportEventKind::LocalCandidate(local_candidate(self.id, "answer")));
            Ok(sdp)
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.network.with_slot(self.id, |hub| match description.kind {
            SdpType::Offer => self.apply_offer(hub, &description.sdp),
            SdpType::Answer => self.apply_answer(hub, &description.sdp),
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.network.with_slot(self.id, |hub| {
            let Some(slot) = hub.links.get_mut(&self.id) else {
                return Err(self.negotiation_error("link vanished"));
            };
            if !slot.remote_description_set {
                return Err(self.negotiation_error("candidate applied before remote description"));
            }
            slot.applied_candidates.push(candidate);
            Ok(())
        })
    }

    fn is_channel_open(&self) -> bool {
        self.network
            .hub
            .lock()
            .links
            .get(&self.id)
            .is_some_and(|slot| slot.open)
    }

    fn send(&self, frame: &str) -> Result<()> {
        let hub = self.network.hub.lock();
        let partner = hub
            .links
            .get(&self.id)
            .filter(|slot| slot.open)
            .and_then(|slot| slot.partner);
        let Some(partner) = partner else {
            return Err(NetworkError::Transport(TransportError::NotConnected(format!(
                "channel to {} is not open",
                self.remote
            ))));
        };

        match hub.links.get(&partner) {
            Some(slot) if slot.open => {
                slot.emit(partner, TransportEventKind::ChannelMessage(frame.to_string()));
                Ok(())
            }
            _ => Err(NetworkError::Transport(TransportError::ChannelClosed(format!(
                "remote end of channel to {} is closed",
                self.remote
            )))),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut hub = self.network.hub.lock();
        let Some(slot) = hub.links.remove(&self.id) else {
            return Ok(());
        };

        if let Some(partner) = slot.partner {
            if let Some(slot) = hub.links.get_mut(&partner) {
                if slot.open {
                    slot.open = false;
                    slot.emit(partner, TransportEventKind::ChannelClosed);
                }
            }
        }
        debug!(link = %self.id, remote = %self.remote, "closed memory link");
        Ok(())
    }
}
