//! Peer connection coordinator.
//!
//! Turns relay traffic and link callbacks into at most one open data channel
//! per remote peer. All input arrives as a [`PeerEvent`] through
//! [`PeerConnectionCoordinator::handle_event`]; the caller serializes events,
//! so session maps need no locking.
//!
//! `handle_event` never waits on the network. Every SDP step, candidate
//! application and signaling send for a session runs, in submission order, on
//! that session's own driver task, which reports back through the node event
//! channel as [`NegotiationEvent`]s. A stalled peer only stalls its own driver.
//!
//! Per-peer lifecycle:
//!
//! ```text
//! absent ──discover──▶ offering ──answer + channel open──▶ connected
//!    │                    │ glare, larger id
//!    └──inbound offer──▶ answering ──channel open──────────▶ connected
//! ```
//!
//! Any active phase can fall to `failed` (transport failure or negotiation
//! error, with a bounded delayed retry) or `closed` (channel closed).

use crate::config::NegotiationConfig;
use crate::error::{NetworkError, Result};
use crate::transport::{PeerLink, PeerTransport, SignalingLink};
use crate::types::{
    EventSender, IceCandidate, LinkId, LinkState, NodeEvent, RelayEvent, SessionDescription,
    SignalPayload, TransportEvent, TransportEventKind,
};
use futures_util::future::join_all;
use notemesh_replica::NodeId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for drivers to close their links
const DRIVER_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Input to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Relay reported a peer (peer-list or peer-joined)
    Discovered(NodeId),
    /// Relay reported a departure
    Left(NodeId),
    Offer { from: NodeId, sdp: String },
    Answer { from: NodeId, sdp: String },
    IceCandidate { from: NodeId, candidate: IceCandidate },
    /// Our link gathered a candidate for the remote
    LocalCandidate { peer: NodeId, link: LinkId, candidate: IceCandidate },
    ChannelOpen { peer: NodeId, link: LinkId },
    ChannelClosed { peer: NodeId, link: LinkId },
    ChannelMessage { peer: NodeId, link: LinkId, data: String },
    StateChanged { peer: NodeId, link: LinkId, state: LinkState },
    /// A session driver finished a step
    Negotiation(NegotiationEvent),
    /// Delayed reconnect fired
    Retry(NodeId),
}

impl PeerEvent {
    /// Expand a relay frame into coordinator events.
    pub fn from_relay(event: RelayEvent) -> Vec<PeerEvent> {
        match event {
            RelayEvent::PeerList { ids } => ids.into_iter().map(PeerEvent::Discovered).collect(),
            RelayEvent::PeerJoined { id } => vec![PeerEvent::Discovered(id)],
            RelayEvent::PeerLeft { id } => vec![PeerEvent::Left(id)],
            RelayEvent::Signal { from, signal } => vec![match signal {
                SignalPayload::Offer { sdp } => PeerEvent::Offer { from, sdp },
                SignalPayload::Answer { sdp } => PeerEvent::Answer { from, sdp },
                SignalPayload::IceCandidate { candidate } => PeerEvent::IceCandidate { from, candidate },
            }],
        }
    }

    /// Expand any node event into coordinator events.
    pub fn from_node_event(event: NodeEvent) -> Vec<PeerEvent> {
        match event {
            NodeEvent::Relay(event) => Self::from_relay(event),
            NodeEvent::Transport(event) => vec![event.into()],
            NodeEvent::Negotiation(event) => vec![PeerEvent::Negotiation(event)],
            NodeEvent::Retry(peer) => vec![PeerEvent::Retry(peer)],
        }
    }
}

impl From<TransportEvent> for PeerEvent {
    fn from(event: TransportEvent) -> Self {
        let TransportEvent { peer, link, kind } = event;
        match kind {
            TransportEventKind::LocalCandidate(candidate) => PeerEvent::LocalCandidate { peer, link, candidate },
            TransportEventKind::ChannelOpen => PeerEvent::ChannelOpen { peer, link },
            TransportEventKind::ChannelClosed => PeerEvent::ChannelClosed { peer, link },
            TransportEventKind::ChannelMessage(data) => PeerEvent::ChannelMessage { peer, link, data },
            TransportEventKind::StateChanged(state) => PeerEvent::StateChanged { peer, link, state },
        }
    }
}

/// Link produced by a session driver.
#[derive(Clone)]
pub struct LinkHandle(Arc<dyn PeerLink>);

impl LinkHandle {
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.0
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinkHandle").field(&self.0.id()).finish()
    }
}

impl PartialEq for LinkHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl Eq for LinkHandle {}

/// Step a session driver completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationStep {
    /// The transport produced the session's link
    LinkReady(LinkHandle),
    OfferSent,
    /// The remote offer or answer was applied
    RemoteDescriptionSet,
    AnswerSent,
    CandidateApplied,
    /// The attempt was abandoned
    Failed(String),
}

/// Result of one driver step, tagged with the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationEvent {
    pub peer: NodeId,
    pub attempt: u64,
    pub step: NegotiationStep,
}

/// What the layer above needs to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// A data channel became usable; `initiator` is true on the offering side
    Opened { peer: NodeId, initiator: bool },
    /// A previously open channel is gone
    Closed { peer: NodeId },
    /// Frame received on an open channel
    Message { peer: NodeId, data: String },
}

/// Negotiation phase of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Offering,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl NegotiationPhase {
    /// Failed and closed sessions behave like absent ones
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Offering | Self::Answering | Self::Connected)
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offering => "offering",
            Self::Answering => "answering",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handle to an open data channel.
#[derive(Clone)]
pub struct PeerChannel {
    pub id: NodeId,
    pub link: Arc<dyn PeerLink>,
}

impl PeerChannel {
    pub fn is_open(&self) -> bool {
        self.link.is_channel_open()
    }

    pub fn send(&self, frame: &str) -> Result<()> {
        self.link.send(frame)
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.id)
            .field("link", &self.link.id())
            .finish()
    }
}

/// Snapshot of one session for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub id: NodeId,
    pub phase: NegotiationPhase,
    pub initiator: bool,
    pub channel_open: bool,
}

/// Negotiation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub glare_yielded: u64,
    pub glare_kept: u64,
    pub candidates_buffered: u64,
    pub candidates_applied: u64,
    pub negotiation_failures: u64,
    pub retries_scheduled: u64,
    pub channels_opened: u64,
}

/// Work queued for a session's driver.
#[derive(Debug)]
enum LinkOp {
    /// Open a link, create the data channel and signal an offer
    Offer,
    /// Open a link and apply the remote offer
    AcceptOffer { sdp: String },
    ApplyAnswer { sdp: String },
    /// Build, set and signal our answer
    SendAnswer,
    Candidate(IceCandidate),
    /// Forward a candidate our link gathered
    SignalCandidate(IceCandidate),
}

/// Coordinator side of a driver task.
struct LinkDriver {
    ops: mpsc::UnboundedSender<LinkOp>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LinkDriver {
    fn submit(&self, op: LinkOp) {
        if self.ops.send(op).is_err() {
            debug!("link driver already stopped, dropping op");
        }
    }

    /// Skips queued work and closes the link once the running step returns.
    fn cancel(self) -> JoinHandle<()> {
        self.cancelled.store(true, Ordering::Release);
        self.task
    }
}

/// Task side: owns the link and runs ops one at a time.
struct DriverTask {
    peer: NodeId,
    attempt: u64,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingLink>,
    events: EventSender,
    cancelled: Arc<AtomicBool>,
    link: Option<Arc<dyn PeerLink>>,
}

impl DriverTask {
    fn live(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    fn post(&self, step: NegotiationStep) {
        let event = NodeEvent::Negotiation(NegotiationEvent {
            peer: self.peer.clone(),
            attempt: self.attempt,
            step,
        });
        if self.events.send(event).is_err() {
            debug!(peer = %self.peer, "node event loop gone, dropping driver result");
        }
    }

    fn link(&self) -> Result<Arc<dyn PeerLink>> {
        self.link
            .clone()
            .ok_or_else(|| NetworkError::negotiation(&self.peer, "no link opened"))
    }

    async fn open(&mut self) -> Result<Arc<dyn PeerLink>> {
        let link = self.transport.open_link(&self.peer, self.events.clone()).await?;
        self.link = Some(link.clone());
        self.post(NegotiationStep::LinkReady(LinkHandle(link.clone())));
        Ok(link)
    }

    async fn signal(&self, signal: SignalPayload) -> Result<()> {
        if !self.live() {
            return Err(NetworkError::negotiation(&self.peer, "attempt cancelled"));
        }
        self.signaling.send_signal(&self.peer, signal).await
    }

    async fn step(&mut self, op: LinkOp) -> Result<()> {
        match op {
            LinkOp::Offer => {
                let link = self.open().await?;
                link.create_data_channel().await?;
                let sdp = link.create_offer().await?;
                self.signal(SignalPayload::Offer { sdp }).await?;
                self.post(NegotiationStep::OfferSent);
            }
            LinkOp::AcceptOffer { sdp } => {
                let link = self.open().await?;
                link.set_remote_description(SessionDescription::offer(sdp)).await?;
                self.post(NegotiationStep::RemoteDescriptionSet);
            }
            LinkOp::ApplyAnswer { sdp } => {
                self.link()?
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await?;
                self.post(NegotiationStep::RemoteDescriptionSet);
            }
            LinkOp::SendAnswer => {
                let sdp = self.link()?.create_answer().await?;
                self.signal(SignalPayload::Answer { sdp }).await?;
                self.post(NegotiationStep::AnswerSent);
            }
            LinkOp::Candidate(candidate) => match self.link()?.add_ice_candidate(candidate).await {
                Ok(()) => self.post(NegotiationStep::CandidateApplied),
                Err(e) => warn!(peer = %self.peer, error = %e, "failed to apply remote candidate"),
            },
            LinkOp::SignalCandidate(candidate) => {
                if let Err(e) = self.signal(SignalPayload::IceCandidate { candidate }).await {
                    e.report("failed to signal local candidate");
                }
            }
        }
        Ok(())
    }

    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<LinkOp>) {
        while let Some(op) = ops.recv().await {
            if !self.live() {
                break;
            }
            if let Err(e) = self.step(op).await {
                if self.live() {
                    self.post(NegotiationStep::Failed(e.to_string()));
                }
                break;
            }
        }

        if let Some(link) = self.link.take() {
            if let Err(e) = link.close().await {
                debug!(peer = %self.peer, "closing link failed: {}", e);
            }
        }
    }
}

struct PeerSession {
    phase: NegotiationPhase,
    /// Tags driver results; a replaced session's results are ignored
    attempt: u64,
    driver: Option<LinkDriver>,
    /// Set once the driver reported the link
    link: Option<Arc<dyn PeerLink>>,
    /// An answer was handed to the driver
    answer_received: bool,
    remote_description_set: bool,
    /// Remote candidates waiting for the remote description, in arrival order
    candidates: VecDeque<IceCandidate>,
    initiator: bool,
}

impl PeerSession {
    fn owns(&self, link: LinkId) -> bool {
        self.link.as_ref().is_some_and(|l| l.id() == link)
    }

    fn submit(&self, op: LinkOp) {
        if let Some(driver) = &self.driver {
            driver.submit(op);
        }
    }

    /// Stops the driver, which closes the link.
    fn stop_driver(&mut self) -> Option<JoinHandle<()>> {
        self.driver.take().map(LinkDriver::cancel)
    }
}

#[derive(Default)]
struct RetryState {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

/// Per-node negotiation state machine.
pub struct PeerConnectionCoordinator {
    local_id: NodeId,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingLink>,
    events: EventSender,
    config: NegotiationConfig,
    sessions: HashMap<NodeId, PeerSession>,
    /// Candidates for peers with no session yet
    pending: HashMap<NodeId, VecDeque<IceCandidate>>,
    /// Peers the relay currently reports as present
    known_peers: HashSet<NodeId>,
    retries: HashMap<NodeId, RetryState>,
    next_attempt: u64,
    stats: CoordinatorStats,
}

impl PeerConnectionCoordinator {
    pub fn new(
        local_id: NodeId,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingLink>,
        events: EventSender,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            local_id,
            transport,
            signaling,
            events,
            config,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            known_peers: HashSet::new(),
            retries: HashMap::new(),
            next_attempt: 1,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    /// Single entry point for every negotiation input.
    pub fn handle_event(&mut self, event: PeerEvent) -> Option<LinkNotice> {
        match event {
            PeerEvent::Discovered(peer) => {
                self.on_discovered(peer);
                None
            }
            PeerEvent::Left(peer) => {
                info!(%peer, "peer left relay");
                self.known_peers.remove(&peer);
                self.remove_peer(&peer)
            }
            PeerEvent::Offer { from, sdp } => self.on_offer(from, sdp),
            PeerEvent::Answer { from, sdp } => {
                self.on_answer(from, sdp);
                None
            }
            PeerEvent::IceCandidate { from, candidate } => {
                self.on_remote_candidate(from, candidate);
                None
            }
            PeerEvent::LocalCandidate { peer, link, candidate } => {
                self.on_local_candidate(peer, link, candidate);
                None
            }
            PeerEvent::ChannelOpen { peer, link } => self.on_channel_open(peer, link),
            PeerEvent::ChannelClosed { peer, link } => self.on_channel_closed(peer, link),
            PeerEvent::ChannelMessage { peer, link, data } => match self.sessions.get(&peer) {
                Some(session) if session.owns(link) && session.phase == NegotiationPhase::Connected => {
                    Some(LinkNotice::Message { peer, data })
                }
                _ => {
                    debug!(%peer, %link, "dropping message from stale or unopened link");
                    None
                }
            },
            PeerEvent::StateChanged { peer, link, state } => self.on_state_changed(peer, link, state),
            PeerEvent::Negotiation(event) => self.on_negotiation(event),
            PeerEvent::Retry(peer) => {
                self.on_retry(peer);
                None
            }
        }
    }

    fn on_discovered(&mut self, peer: NodeId) {
        if peer == self.local_id {
            return;
        }
        self.known_peers.insert(peer.clone());
        if self.is_active(&peer) {
            debug!(%peer, "already negotiating or connected, ignoring discovery");
            return;
        }
        self.start_offer(peer);
    }

    fn is_active(&self, peer: &NodeId) -> bool {
        self.sessions.get(peer).is_some_and(|s| s.phase.is_active())
    }

    /// Replaces any session for `peer` with a fresh one and starts its driver.
    fn open_session(&mut self, peer: &NodeId, phase: NegotiationPhase, first: LinkOp) {
        let carried = self.discard_session(peer);
        let mut candidates = self.pending.remove(peer).unwrap_or_default();
        candidates.extend(carried);

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let (ops, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = DriverTask {
            peer: peer.clone(),
            attempt,
            transport: self.transport.clone(),
            signaling: self.signaling.clone(),
            events: self.events.clone(),
            cancelled: cancelled.clone(),
            link: None,
        };
        let driver = LinkDriver {
            ops,
            cancelled,
            task: tokio::spawn(task.run(rx)),
        };
        driver.submit(first);

        self.sessions.insert(
            peer.clone(),
            PeerSession {
                phase,
                attempt,
                driver: Some(driver),
                link: None,
                answer_received: false,
                remote_description_set: false,
                candidates,
                initiator: phase == NegotiationPhase::Offering,
            },
        );
    }

    /// absent → offering
    fn start_offer(&mut self, peer: NodeId) {
        info!(%peer, "starting negotiation as offerer");
        self.open_session(&peer, NegotiationPhase::Offering, LinkOp::Offer);
    }

    fn on_offer(&mut self, from: NodeId, sdp: String) -> Option<LinkNotice> {
        if from == self.local_id {
            return None;
        }
        self.known_peers.insert(from.clone());

        let mut notice = None;
        match self.sessions.get(&from).map(|s| s.phase) {
            Some(NegotiationPhase::Offering) => {
                if self.local_id < from {
                    // The larger id answers; keep waiting for ours to be answered
                    self.stats.glare_kept += 1;
                    info!(peer = %from, "glare: keeping own offer, ignoring remote offer");
                    return None;
                }
                self.stats.glare_yielded += 1;
                info!(peer = %from, "glare: discarding own offer to answer remote");
            }
            Some(NegotiationPhase::Answering) => {
                info!(peer = %from, "remote restarted negotiation, replacing session");
            }
            Some(NegotiationPhase::Connected) => {
                info!(peer = %from, "remote restarted negotiation, replacing session");
                notice = Some(LinkNotice::Closed { peer: from.clone() });
            }
            _ => {}
        }

        // absent → answering; registered here so racing candidates land in this session
        info!(peer = %from, "answering remote offer");
        self.open_session(&from, NegotiationPhase::Answering, LinkOp::AcceptOffer { sdp });
        notice
    }

    fn on_answer(&mut self, from: NodeId, sdp: String) {
        match self.sessions.get_mut(&from) {
            None => NetworkError::UnknownPeer(from).report("dropping answer"),
            Some(session) if session.phase != NegotiationPhase::Offering || session.answer_received => {
                warn!(peer = %from, phase = %session.phase, "unexpected answer, dropping");
            }
            Some(session) => {
                session.answer_received = true;
                session.submit(LinkOp::ApplyAnswer { sdp });
                debug!(peer = %from, "applying answer");
            }
        }
    }

    /// Marks the remote description set and hands buffered candidates to the
    /// driver once, in arrival order; an answering session then answers.
    fn drain_candidates(&mut self, peer: &NodeId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        session.remote_description_set = true;
        let buffered = std::mem::take(&mut session.candidates);
        if !buffered.is_empty() {
            debug!(%peer, count = buffered.len(), "applying buffered candidates");
        }
        for candidate in buffered {
            session.submit(LinkOp::Candidate(candidate));
        }
        if session.phase == NegotiationPhase::Answering {
            session.submit(LinkOp::SendAnswer);
        }
    }

    fn on_remote_candidate(&mut self, from: NodeId, candidate: IceCandidate) {
        let limit = self.config.max_pending_candidates;
        match self.sessions.get_mut(&from) {
            Some(session) if session.phase.is_active() && session.remote_description_set => {
                session.submit(LinkOp::Candidate(candidate));
                return;
            }
            Some(session) if session.phase.is_active() => {
                push_bounded(&mut session.candidates, candidate, limit, &from);
            }
            _ => {
                let buffer = self.pending.entry(from.clone()).or_default();
                push_bounded(buffer, candidate, limit, &from);
            }
        }
        self.stats.candidates_buffered += 1;
        debug!(peer = %from, "buffered remote candidate");
    }

    fn on_local_candidate(&mut self, peer: NodeId, link: LinkId, candidate: IceCandidate) {
        match self.sessions.get(&peer) {
            Some(session) if session.owns(link) && session.phase.is_active() => {
                session.submit(LinkOp::SignalCandidate(candidate));
            }
            _ => debug!(%peer, %link, "dropping candidate from stale link"),
        }
    }

    fn on_negotiation(&mut self, event: NegotiationEvent) -> Option<LinkNotice> {
        let NegotiationEvent { peer, attempt, step } = event;
        let session = match self.sessions.get_mut(&peer) {
            Some(session) if session.attempt == attempt && session.phase.is_active() => session,
            _ => {
                debug!(%peer, attempt, "dropping result of abandoned negotiation");
                return None;
            }
        };

        match step {
            NegotiationStep::LinkReady(handle) => {
                debug!(%peer, link = %handle.link().id(), "link ready");
                session.link = Some(handle.0);
            }
            NegotiationStep::OfferSent => {
                self.stats.offers_sent += 1;
                debug!(%peer, "offer sent");
            }
            NegotiationStep::RemoteDescriptionSet => self.drain_candidates(&peer),
            NegotiationStep::AnswerSent => {
                self.stats.answers_sent += 1;
                debug!(%peer, "answer sent");
            }
            NegotiationStep::CandidateApplied => self.stats.candidates_applied += 1,
            NegotiationStep::Failed(reason) => {
                self.stats.negotiation_failures += 1;
                NetworkError::negotiation(&peer, reason).report("negotiation attempt abandoned");
                return self.fail_session(&peer);
            }
        }
        None
    }

    fn on_channel_open(&mut self, peer: NodeId, link: LinkId) -> Option<LinkNotice> {
        let session = self.sessions.get_mut(&peer)?;
        if !session.owns(link) || !matches!(session.phase, NegotiationPhase::Offering | NegotiationPhase::Answering) {
            debug!(%peer, %link, "ignoring channel open from stale link");
            return None;
        }
        session.phase = NegotiationPhase::Connected;
        let initiator = session.initiator;

        if let Some(mut retry) = self.retries.remove(&peer) {
            if let Some(timer) = retry.timer.take() {
                timer.abort();
            }
        }
        self.stats.channels_opened += 1;
        info!(%peer, initiator, "data channel open");
        Some(LinkNotice::Opened { peer, initiator })
    }

    fn on_channel_closed(&mut self, peer: NodeId, link: LinkId) -> Option<LinkNotice> {
        let session = self.sessions.get_mut(&peer)?;
        if !session.owns(link) || !session.phase.is_active() {
            return None;
        }
        let was_connected = session.phase == NegotiationPhase::Connected;
        session.phase = NegotiationPhase::Closed;
        session.stop_driver();
        info!(%peer, "data channel closed");
        was_connected.then_some(LinkNotice::Closed { peer })
    }

    fn on_state_changed(&mut self, peer: NodeId, link: LinkId, state: LinkState) -> Option<LinkNotice> {
        if !self.sessions.get(&peer).is_some_and(|s| s.owns(link) && s.phase.is_active()) {
            return None;
        }
        match state {
            LinkState::Failed => {
                warn!(%peer, "peer connection failed");
                self.fail_session(&peer)
            }
            LinkState::Disconnected => {
                // May recover on its own; a later failure triggers the retry
                info!(%peer, "peer connection disconnected");
                None
            }
            other => {
                debug!(%peer, state = ?other, "peer connection state");
                None
            }
        }
    }

    /// active → failed, closing the link and arming a retry.
    fn fail_session(&mut self, peer: &NodeId) -> Option<LinkNotice> {
        let session = self.sessions.get_mut(peer)?;
        let was_connected = session.phase == NegotiationPhase::Connected;
        session.phase = NegotiationPhase::Failed;
        session.candidates.clear();
        session.stop_driver();

        self.schedule_retry(peer);
        was_connected.then(|| LinkNotice::Closed { peer: peer.clone() })
    }

    fn schedule_retry(&mut self, peer: &NodeId) {
        if !self.known_peers.contains(peer) {
            return;
        }
        let retry = self.retries.entry(peer.clone()).or_default();
        if retry.attempts >= self.config.max_retries {
            warn!(%peer, attempts = retry.attempts, "giving up on peer until rediscovered");
            return;
        }
        retry.attempts += 1;
        if let Some(timer) = retry.timer.take() {
            timer.abort();
        }

        let delay = self.config.retry_delay();
        let events = self.events.clone();
        let target = peer.clone();
        retry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(NodeEvent::Retry(target));
        }));
        self.stats.retries_scheduled += 1;
        info!(%peer, delay_ms = delay.as_millis() as u64, attempt = retry.attempts, "reconnect scheduled");
    }

    fn on_retry(&mut self, peer: NodeId) {
        if let Some(retry) = self.retries.get_mut(&peer) {
            retry.timer = None;
        }
        if !self.known_peers.contains(&peer) || self.is_active(&peer) {
            debug!(%peer, "retry no longer needed");
            return;
        }
        info!(%peer, "retrying connection");
        self.start_offer(peer);
    }

    /// Drops the current session, returning remote candidates it still buffered.
    fn discard_session(&mut self, peer: &NodeId) -> VecDeque<IceCandidate> {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                session.stop_driver();
                session.candidates
            }
            None => VecDeque::new(),
        }
    }

    fn remove_session(&mut self, peer: &NodeId) -> Option<(PeerSession, Option<JoinHandle<()>>)> {
        if let Some(retry) = self.retries.remove(peer) {
            if let Some(timer) = retry.timer {
                timer.abort();
            }
        }
        self.pending.remove(peer);

        let mut session = self.sessions.remove(peer)?;
        let driver = session.stop_driver();
        info!(%peer, "peer removed");
        Some((session, driver))
    }

    /// Releases everything held for `peer`; safe to call repeatedly.
    ///
    /// In-flight negotiation is abandoned at once; the link closes in the
    /// background.
    pub fn remove_peer(&mut self, peer: &NodeId) -> Option<LinkNotice> {
        let (session, _) = self.remove_session(peer)?;
        (session.phase == NegotiationPhase::Connected).then(|| LinkNotice::Closed { peer: peer.clone() })
    }

    /// Removes every peer, giving their links a moment to close.
    pub async fn shutdown(&mut self) -> Vec<LinkNotice> {
        let peers: Vec<NodeId> = self
            .sessions
            .keys()
            .chain(self.retries.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut notices = Vec::new();
        let mut drivers = Vec::new();
        for peer in peers {
            if let Some((session, driver)) = self.remove_session(&peer) {
                if session.phase == NegotiationPhase::Connected {
                    notices.push(LinkNotice::Closed { peer });
                }
                drivers.extend(driver);
            }
        }
        self.pending.clear();
        self.known_peers.clear();

        if tokio::time::timeout(DRIVER_CLOSE_GRACE, join_all(drivers)).await.is_err() {
            warn!("some peer links did not close in time");
        }
        notices
    }

    /// Channel of one connected peer.
    pub fn channel(&self, peer: &NodeId) -> Option<PeerChannel> {
        let session = self.sessions.get(peer)?;
        if session.phase != NegotiationPhase::Connected {
            return None;
        }
        session.link.clone().map(|link| PeerChannel { id: peer.clone(), link })
    }

    /// Every peer with an active session and a link, ordered by id.
    ///
    /// Channels that are still negotiating are included; dissemination
    /// counts them as failed deliveries.
    pub fn peer_channels(&self) -> Vec<PeerChannel> {
        let mut channels: Vec<PeerChannel> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.phase.is_active())
            .filter_map(|(id, s)| s.link.clone().map(|link| PeerChannel { id: id.clone(), link }))
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }

    /// Connected peer ids, ordered.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.phase == NegotiationPhase::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Status of every session, ordered by peer id.
    pub fn peer_status(&self) -> Vec<PeerStatus> {
        let mut status: Vec<PeerStatus> = self
            .sessions
            .iter()
            .map(|(id, s)| PeerStatus {
                id: id.clone(),
                phase: s.phase,
                initiator: s.initiator,
                channel_open: s.link.as_ref().is_some_and(|l| l.is_channel_open()),
            })
            .collect();
        status.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }

    /// Phase of one peer's session, `None` when absent.
    pub fn phase(&self, peer: &NodeId) -> Option<NegotiationPhase> {
        self.sessions.get(peer).map(|s| s.phase)
    }

    /// Candidates held for a peer, either in its session or the pending buffer.
    pub fn buffered_candidates(&self, peer: &NodeId) -> usize {
        self.sessions
            .get(peer)
            .map(|s| s.candidates.len())
            .or_else(|| self.pending.get(peer).map(VecDeque::len))
            .unwrap_or(0)
    }
}

fn push_bounded(buffer: &mut VecDeque<IceCandidate>, candidate: IceCandidate, limit: usize, peer: &NodeId) {
    if buffer.len() >= limit {
        warn!(%peer, limit, "candidate buffer full, dropping oldest");
        buffer.pop_front();
    }
    buffer.push_back(candidate);
}
