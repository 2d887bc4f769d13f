//! Dissemination policies.
//!
//! A policy decides which peer channels receive an outbound envelope and how.
//! Delivery is a synchronous enqueue on each selected channel; the report
//! counts what happened. Gossip ids, peer priorities and the batch queue live
//! in the [`BroadcastManager`] so that switching policy never forgets them.

use crate::config::{DisseminationConfig, MAX_PRIORITY};
use crate::coordinator::PeerChannel;
use crate::error::{NetworkError, Result};
use crate::protocol::{new_message_id, Envelope, WireMessage};
use notemesh_replica::{NodeId, Timestamp};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Serializable name of a dissemination policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastPolicyKind {
    #[default]
    BroadcastAll,
    Selective,
    Gossip,
    Priority,
    Batch,
}

impl BroadcastPolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastPolicyKind::BroadcastAll => "broadcast-all",
            BroadcastPolicyKind::Selective => "selective",
            BroadcastPolicyKind::Gossip => "gossip",
            BroadcastPolicyKind::Priority => "priority",
            BroadcastPolicyKind::Batch => "batch",
        }
    }
}

impl fmt::Display for BroadcastPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BroadcastPolicyKind {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broadcast-all" => Ok(BroadcastPolicyKind::BroadcastAll),
            "selective" => Ok(BroadcastPolicyKind::Selective),
            "gossip" => Ok(BroadcastPolicyKind::Gossip),
            "priority" => Ok(BroadcastPolicyKind::Priority),
            "batch" => Ok(BroadcastPolicyKind::Batch),
            other => Err(NetworkError::Configuration(format!("unknown broadcast policy: {other}"))),
        }
    }
}

/// Predicate choosing the peers a selective broadcast goes to.
pub type PeerSelector = Arc<dyn Fn(&PeerChannel, &Envelope) -> bool + Send + Sync>;

/// Active dissemination policy.
#[derive(Clone)]
pub enum DisseminationPolicy {
    /// Every peer with an open channel
    All,
    /// Peers passing the selector; `None` selects open channels
    Selective(Option<PeerSelector>),
    /// Random subset of open peers, de-duplicated by envelope id
    Gossip { fanout: usize },
    /// Peers whose priority is at least the message's, highest first
    Priority,
    /// Queue and flush as one envelope on size or delay
    Batch { size: usize, delay: Duration },
}

impl DisseminationPolicy {
    pub fn kind(&self) -> BroadcastPolicyKind {
        match self {
            DisseminationPolicy::All => BroadcastPolicyKind::BroadcastAll,
            DisseminationPolicy::Selective(_) => BroadcastPolicyKind::Selective,
            DisseminationPolicy::Gossip { .. } => BroadcastPolicyKind::Gossip,
            DisseminationPolicy::Priority => BroadcastPolicyKind::Priority,
            DisseminationPolicy::Batch { .. } => BroadcastPolicyKind::Batch,
        }
    }

    /// Policy of `kind` with parameters from `config`
    pub fn from_kind(kind: BroadcastPolicyKind, config: &DisseminationConfig) -> Self {
        match kind {
            BroadcastPolicyKind::BroadcastAll => DisseminationPolicy::All,
            BroadcastPolicyKind::Selective => DisseminationPolicy::Selective(None),
            BroadcastPolicyKind::Gossip => DisseminationPolicy::Gossip {
                fanout: config.gossip_fanout,
            },
            BroadcastPolicyKind::Priority => DisseminationPolicy::Priority,
            BroadcastPolicyKind::Batch => DisseminationPolicy::Batch {
                size: config.batch_size,
                delay: config.batch_delay(),
            },
        }
    }
}

impl fmt::Debug for DisseminationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisseminationPolicy::Selective(selector) => f
                .debug_tuple("Selective")
                .field(&selector.as_ref().map(|_| "custom"))
                .finish(),
            DisseminationPolicy::Gossip { fanout } => f.debug_struct("Gossip").field("fanout", fanout).finish(),
            DisseminationPolicy::Batch { size, delay } => f
                .debug_struct("Batch")
                .field("size", size)
                .field("delay", delay)
                .finish(),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Message priority for the priority policy
    pub priority: Option<u8>,
    /// Peer never selected, e.g. the sender of a forwarded message
    pub exclude: Option<NodeId>,
}

/// Outcome of one broadcast or flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub policy: BroadcastPolicyKind,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Peer channels considered
    pub total: usize,
    /// Message went into the batch queue
    pub queued: bool,
    /// Gossip id already seen; nothing was sent
    pub cached: bool,
    pub messages_in_batch: usize,
    pub hop_count: Option<u32>,
}

impl BroadcastReport {
    fn new(policy: BroadcastPolicyKind, total: usize) -> Self {
        Self {
            policy,
            total,
            ..Default::default()
        }
    }

    fn deliver(&mut self, channel: &PeerChannel, frame: &str) {
        if !channel.is_open() {
            self.failed += 1;
            return;
        }
        match channel.send(frame) {
            Ok(()) => self.sent += 1,
            Err(e) => {
                warn!(peer = %channel.id, error = %e, "delivery failed");
                self.failed += 1;
            }
        }
    }
}

/// Cumulative dissemination counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub total_messages: u64,
    pub total_sent: u64,
    pub total_failed: u64,
}

impl BroadcastStats {
    /// Fraction of attempted deliveries that succeeded
    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.total_sent + self.total_failed;
        (attempts > 0).then(|| self.total_sent as f64 / attempts as f64)
    }
}

/// Owns the active policy and the state every policy shares.
pub struct BroadcastManager {
    policy: DisseminationPolicy,
    config: DisseminationConfig,
    /// Gossip ids and when they were first seen
    seen: HashMap<String, Instant>,
    priorities: HashMap<NodeId, u8>,
    queue: Vec<Envelope>,
    deadline: Option<Instant>,
    stats: BroadcastStats,
}

impl BroadcastManager {
    pub fn new(config: DisseminationConfig) -> Self {
        Self {
            policy: DisseminationPolicy::from_kind(config.policy, &config),
            config,
            seen: HashMap::new(),
            priorities: HashMap::new(),
            queue: Vec::new(),
            deadline: None,
            stats: BroadcastStats::default(),
        }
    }

    pub fn policy(&self) -> &DisseminationPolicy {
        &self.policy
    }

    pub fn policy_kind(&self) -> BroadcastPolicyKind {
        self.policy.kind()
    }

    /// Switches policy at runtime; a pending batch is flushed first.
    pub fn set_policy(&mut self, policy: DisseminationPolicy, channels: &[PeerChannel]) -> Option<BroadcastReport> {
        let flushed = (!self.queue.is_empty()).then(|| self.flush_due(channels));
        info!(from = %self.policy.kind(), to = %policy.kind(), "switching broadcast policy");
        self.policy = policy;
        flushed
    }

    /// Switches to the default parameters of `kind`.
    pub fn set_policy_kind(&mut self, kind: BroadcastPolicyKind, channels: &[PeerChannel]) -> Option<BroadcastReport> {
        let policy = DisseminationPolicy::from_kind(kind, &self.config);
        self.set_policy(policy, channels)
    }

    /// Sets a peer's priority, clamped to 0..=10.
    pub fn set_peer_priority(&mut self, peer: NodeId, priority: u8) {
        let priority = priority.min(MAX_PRIORITY);
        debug!(%peer, priority, "peer priority set");
        self.priorities.insert(peer, priority);
    }

    pub fn peer_priority(&self, peer: &NodeId) -> u8 {
        self.priorities
            .get(peer)
            .copied()
            .unwrap_or(self.config.default_priority)
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = BroadcastStats::default();
    }

    /// Messages waiting in the batch queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// When the pending batch must be flushed, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Flushes the batch if its deadline has passed.
    pub fn poll_timers(&mut self, now: Instant, channels: &[PeerChannel]) -> Option<BroadcastReport> {
        match self.deadline {
            Some(deadline) if deadline <= now => Some(self.flush_due(channels)),
            _ => None,
        }
    }

    /// Disseminates `envelope` through the active policy.
    pub fn broadcast(&mut self, channels: &[PeerChannel], envelope: Envelope, options: &BroadcastOptions) -> BroadcastReport {
        self.stats.total_messages += 1;
        let report = match self.policy.clone() {
            DisseminationPolicy::All => self.send_all(channels, &envelope, options),
            DisseminationPolicy::Selective(selector) => self.send_selective(channels, &envelope, options, selector),
            DisseminationPolicy::Gossip { fanout } => self.send_gossip(channels, envelope, options, fanout),
            DisseminationPolicy::Priority => self.send_priority(channels, &envelope, options),
            DisseminationPolicy::Batch { size, delay } => self.enqueue(channels, envelope, size, delay),
        };
        self.record(&report);
        debug!(
            policy = %report.policy,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "broadcast complete"
        );
        report
    }

    fn record(&mut self, report: &BroadcastReport) {
        self.stats.total_sent += report.sent as u64;
        self.stats.total_failed += report.failed as u64;
    }

    fn encode(envelope: &Envelope, report: &mut BroadcastReport) -> Option<String> {
        match envelope.encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                e.report("dropping unencodable message");
                report.failed = report.total;
                None
            }
        }
    }

    fn send_all(&self, channels: &[PeerChannel], envelope: &Envelope, options: &BroadcastOptions) -> BroadcastReport {
        let mut report = BroadcastReport::new(BroadcastPolicyKind::BroadcastAll, channels.len());
        let Some(frame) = Self::encode(envelope, &mut report) else {
            return report;
        };
        for channel in channels {
            if options.exclude.as_ref() == Some(&channel.id) {
                report.skipped += 1;
                continue;
            }
            report.deliver(channel, &frame);
        }
        report
    }

    fn send_selective(
        &self,
        channels: &[PeerChannel],
        envelope: &Envelope,
        options: &BroadcastOptions,
        selector: Option<PeerSelector>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::new(BroadcastPolicyKind::Selective, channels.len());
        let Some(frame) = Self::encode(envelope, &mut report) else {
            return report;
        };
        for channel in channels {
            let selected = options.exclude.as_ref() != Some(&channel.id)
                && match &selector {
                    Some(selector) => selector(channel, envelope),
                    None => channel.is_open(),
                };
            if !selected {
                report.skipped += 1;
                continue;
            }
            report.deliver(channel, &frame);
        }
        report
    }

    fn prune_seen(&mut self, now: Instant) {
        let ttl = self.config.gossip_ttl();
        self.seen.retain(|_, first_seen| now.duration_since(*first_seen) < ttl);
    }

    /// Records a gossip id; false when it was already seen within the ttl.
    pub fn observe_gossip(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.prune_seen(now);
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        true
    }

    fn send_gossip(
        &mut self,
        channels: &[PeerChannel],
        mut envelope: Envelope,
        options: &BroadcastOptions,
        fanout: usize,
    ) -> BroadcastReport {
        let id = envelope.id.get_or_insert_with(new_message_id).clone();
        if !self.observe_gossip(&id) {
            debug!(message = %id, "gossip message already seen");
            let mut report = BroadcastReport::new(BroadcastPolicyKind::Gossip, channels.len());
            report.cached = true;
            return report;
        }
        self.gossip_round(channels, &envelope, options.exclude.as_ref(), fanout)
    }

    fn gossip_round(
        &self,
        channels: &[PeerChannel],
        envelope: &Envelope,
        exclude: Option<&NodeId>,
        fanout: usize,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::new(BroadcastPolicyKind::Gossip, channels.len());
        let hop = envelope.gossip_hop();
        report.hop_count = Some(hop.hop_count);
        let Some(frame) = Self::encode(&hop, &mut report) else {
            return report;
        };

        let active: Vec<&PeerChannel> = channels
            .iter()
            .filter(|c| c.is_open() && exclude != Some(&c.id))
            .collect();
        let selected: Vec<&PeerChannel> = active
            .choose_multiple(&mut rand::thread_rng(), fanout)
            .copied()
            .collect();
        report.skipped = active.len() - selected.len();

        for channel in selected {
            report.deliver(channel, &frame);
        }
        report
    }

    /// Relays a received gossip envelope to a fresh random subset, excluding its sender.
    ///
    /// Stops once the hop limit is reached.
    pub fn forward_gossip(&mut self, channels: &[PeerChannel], envelope: &Envelope, from: &NodeId) -> Option<BroadcastReport> {
        if envelope.hop_count >= self.config.gossip_max_hops {
            debug!(hops = envelope.hop_count, "gossip hop limit reached");
            return None;
        }
        let report = self.gossip_round(channels, envelope, Some(from), self.config.gossip_fanout);
        self.record(&report);
        Some(report)
    }

    fn send_priority(&self, channels: &[PeerChannel], envelope: &Envelope, options: &BroadcastOptions) -> BroadcastReport {
        let mut report = BroadcastReport::new(BroadcastPolicyKind::Priority, channels.len());
        let Some(frame) = Self::encode(envelope, &mut report) else {
            return report;
        };
        let message_priority = options
            .priority
            .unwrap_or(self.config.default_priority)
            .min(MAX_PRIORITY);

        let mut ordered: Vec<&PeerChannel> = channels.iter().collect();
        ordered.sort_by(|a, b| {
            self.peer_priority(&b.id)
                .cmp(&self.peer_priority(&a.id))
                .then_with(|| a.id.cmp(&b.id))
        });

        for channel in ordered {
            if self.peer_priority(&channel.id) < message_priority || options.exclude.as_ref() == Some(&channel.id) {
                report.skipped += 1;
                continue;
            }
            report.deliver(channel, &frame);
        }
        report
    }

    fn enqueue(&mut self, channels: &[PeerChannel], envelope: Envelope, size: usize, delay: Duration) -> BroadcastReport {
        self.queue.push(envelope);
        if self.queue.len() >= size {
            return self.flush(channels);
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + delay);
        }

        let mut report = BroadcastReport::new(BroadcastPolicyKind::Batch, channels.len());
        report.queued = true;
        report.messages_in_batch = self.queue.len();
        report
    }

    /// Sends every queued message as one batch envelope and clears queue and timer.
    pub fn flush(&mut self, channels: &[PeerChannel]) -> BroadcastReport {
        self.deadline = None;
        let mut report = BroadcastReport::new(BroadcastPolicyKind::Batch, channels.len());
        if self.queue.is_empty() {
            return report;
        }

        let messages = std::mem::take(&mut self.queue);
        report.messages_in_batch = messages.len();
        let batch = Envelope::direct(WireMessage::Batch {
            messages,
            timestamp: Timestamp::now(),
        });
        let Some(frame) = Self::encode(&batch, &mut report) else {
            return report;
        };

        for channel in channels.iter().filter(|c| c.is_open()) {
            report.deliver(channel, &frame);
        }
        info!(messages = report.messages_in_batch, peers = report.sent, "batch flushed");
        report
    }

    /// Flush triggered by the batch timer; counted in the totals.
    pub fn flush_due(&mut self, channels: &[PeerChannel]) -> BroadcastReport {
        let report = self.flush(channels);
        self.record(&report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::PeerLink;
    use crate::types::{IceCandidate, LinkId, SessionDescription};
    use async_trait::async_trait;
    use notemesh_replica::{NoteId, NoteRecord};
    use parking_lot::Mutex;

    struct RecordingLink {
        id: LinkId,
        open: bool,
        fail_send: bool,
        frames: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        fn id(&self) -> LinkId {
            self.id
        }
        async fn create_data_channel(&self) -> Result<()> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn create_answer(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            Ok(())
        }
        fn is_channel_open(&self) -> bool {
            self.open
        }
        fn send(&self, frame: &str) -> Result<()> {
            if self.fail_send {
                return Err(NetworkError::Transport(TransportError::ChannelClosed("boom".into())));
            }
            self.frames.lock().push(frame.to_string());
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Peers {
        channels: Vec<PeerChannel>,
        links: Vec<Arc<RecordingLink>>,
    }

    impl Peers {
        fn new(specs: &[(&str, bool)]) -> Self {
            let mut channels = Vec::new();
            let mut links = Vec::new();
            for (id, open) in specs {
                let link = Arc::new(RecordingLink {
                    id: LinkId::next(),
                    open: *open,
                    fail_send: false,
                    frames: Mutex::new(Vec::new()),
                });
                channels.push(PeerChannel { id: NodeId::from(*id), link: link.clone() });
                links.push(link);
            }
            Self { channels, links }
        }

        fn frames(&self, index: usize) -> Vec<serde_json::Value> {
            self.links[index]
                .frames
                .lock()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }

        fn delivered(&self) -> usize {
            self.links.iter().map(|l| l.frames.lock().len()).sum()
        }
    }

    fn envelope(n: u64) -> Envelope {
        Envelope::new(WireMessage::NoteCreated {
            note: NoteRecord {
                id: NoteId::new(format!("n{n}")),
                title: "t".into(),
                body: "b".into(),
                updated_at: Timestamp::from_millis(n),
                version: Some(1),
                origin_node_id: NodeId::from("node_a"),
                author_node_id: NodeId::from("node_a"),
                merged: false,
            },
        })
    }

    fn manager(kind: BroadcastPolicyKind) -> BroadcastManager {
        BroadcastManager::new(DisseminationConfig {
            policy: kind,
            gossip_fanout: 2,
            batch_size: 3,
            batch_delay_ms: 100,
            ..Default::default()
        })
    }

    #[test]
    fn test_all_counts_unopened_as_failed() {
        let peers = Peers::new(&[("node_b", true), ("node_c", false), ("node_d", true)]);
        let mut manager = manager(BroadcastPolicyKind::BroadcastAll);

        let report = manager.broadcast(&peers.channels, envelope(1), &BroadcastOptions::default());
        assert_eq!((report.sent, report.failed, report.total), (2, 1, 3));
        assert_eq!(manager.stats().total_messages, 1);
        assert_eq!(manager.stats().success_rate(), Some(2.0 / 3.0));
    }

    #[test]
    fn test_selective_uses_predicate() {
        let peers = Peers::new(&[("node_b", true), ("node_c", true), ("node_d", false)]);
        let mut manager = manager(BroadcastPolicyKind::Selective);

        let report = manager.broadcast(&peers.channels, envelope(1), &BroadcastOptions::default());
        assert_eq!((report.sent, report.failed, report.skipped), (2, 0, 1));

        let only_c: PeerSelector = Arc::new(|channel, _| channel.id.as_str() == "node_c");
        manager.set_policy(DisseminationPolicy::Selective(Some(only_c)), &peers.channels);
        let report = manager.broadcast(&peers.channels, envelope(2), &BroadcastOptions::default());
        assert_eq!((report.sent, report.skipped), (1, 2));
        assert_eq!(peers.frames(1).len(), 2);
    }

    #[tokio::test]
    async fn test_gossip_never_redelivers_seen_id() {
        let peers = Peers::new(&[("node_b", true), ("node_c", true), ("node_d", true), ("node_e", false)]);
        let mut manager = manager(BroadcastPolicyKind::Gossip);
        let message = envelope(1);

        let first = manager.broadcast(&peers.channels, message.clone(), &BroadcastOptions::default());
        assert_eq!(first.sent, 2);
        assert_eq!(first.hop_count, Some(1));
        assert_eq!(peers.delivered(), 2);

        for _ in 0..5 {
            let again = manager.broadcast(&peers.channels, message.clone(), &BroadcastOptions::default());
            assert!(again.cached);
            assert_eq!(again.sent, 0);
        }
        assert_eq!(peers.delivered(), 2);

        let frames: Vec<_> = (0..3).flat_map(|i| peers.frames(i)).collect();
        assert!(frames.iter().all(|f| f["gossip"] == true && f["hopCount"] == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gossip_ids_expire_after_ttl() {
        let mut manager = BroadcastManager::new(DisseminationConfig {
            gossip_ttl_ms: 1000,
            ..Default::default()
        });
        assert!(manager.observe_gossip("msg_1"));
        assert!(!manager.observe_gossip("msg_1"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(manager.observe_gossip("msg_1"));
    }

    #[test]
    fn test_forward_gossip_excludes_sender_and_respects_hop_limit() {
        let peers = Peers::new(&[("node_b", true), ("node_c", true)]);
        let mut manager = BroadcastManager::new(DisseminationConfig {
            gossip_fanout: 5,
            gossip_max_hops: 2,
            ..Default::default()
        });

        let mut message = envelope(1).gossip_hop();
        let report = manager
            .forward_gossip(&peers.channels, &message, &NodeId::from("node_b"))
            .unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(peers.frames(0).len(), 0);
        assert_eq!(peers.frames(1)[0]["hopCount"], 2);

        message.hop_count = 2;
        assert!(manager
            .forward_gossip(&peers.channels, &message, &NodeId::from("node_b"))
            .is_none());
    }

    #[test]
    fn test_priority_orders_and_filters() {
        let peers = Peers::new(&[("node_b", true), ("node_c", true), ("node_d", false), ("node_e", true)]);
        let mut manager = manager(BroadcastPolicyKind::Priority);
        manager.set_peer_priority(NodeId::from("node_b"), 3);
        manager.set_peer_priority(NodeId::from("node_c"), 9);
        manager.set_peer_priority(NodeId::from("node_d"), 200);
        assert_eq!(manager.peer_priority(&NodeId::from("node_d")), 10);
        assert_eq!(manager.peer_priority(&NodeId::from("node_e")), 5);

        let report = manager.broadcast(
            &peers.channels,
            envelope(1),
            &BroadcastOptions { priority: Some(5), ..Default::default() },
        );
        // node_d is selected but closed, node_b is below the message priority
        assert_eq!((report.sent, report.failed, report.skipped), (2, 1, 1));
        assert!(peers.frames(0).is_empty());
    }

    #[test]
    fn test_batch_flushes_on_size() {
        let peers = Peers::new(&[("node_b", true), ("node_c", false)]);
        let mut manager = manager(BroadcastPolicyKind::Batch);

        for n in 1..=2 {
            let report = manager.broadcast(&peers.channels, envelope(n), &BroadcastOptions::default());
            assert!(report.queued);
            assert_eq!(report.messages_in_batch, n as usize);
        }
        assert!(manager.next_deadline().is_some());

        let report = manager.broadcast(&peers.channels, envelope(3), &BroadcastOptions::default());
        assert!(!report.queued);
        assert_eq!((report.sent, report.failed, report.messages_in_batch), (1, 0, 3));
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(manager.queued(), 0);

        let frames = peers.frames(0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "batch");
        assert_eq!(frames[0]["messages"].as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_deadline_flushes_once() {
        let peers = Peers::new(&[("node_b", true)]);
        let mut manager = manager(BroadcastPolicyKind::Batch);
        manager.broadcast(&peers.channels, envelope(1), &BroadcastOptions::default());

        let deadline = manager.next_deadline().unwrap();
        assert!(manager.poll_timers(deadline - Duration::from_millis(1), &peers.channels).is_none());

        tokio::time::advance(Duration::from_millis(100)).await;
        let report = manager.poll_timers(Instant::now(), &peers.channels).unwrap();
        assert_eq!(report.messages_in_batch, 1);
        assert!(manager.poll_timers(Instant::now(), &peers.channels).is_none());
        assert_eq!(peers.frames(0).len(), 1);
    }

    #[test]
    fn test_switching_away_from_batch_flushes_queue() {
        let peers = Peers::new(&[("node_b", true)]);
        let mut manager = manager(BroadcastPolicyKind::Batch);
        manager.broadcast(&peers.channels, envelope(1), &BroadcastOptions::default());

        let flushed = manager
            .set_policy_kind(BroadcastPolicyKind::BroadcastAll, &peers.channels)
            .unwrap();
        assert_eq!(flushed.messages_in_batch, 1);
        assert_eq!(manager.policy_kind(), BroadcastPolicyKind::BroadcastAll);
        assert!(manager.set_policy_kind(BroadcastPolicyKind::Gossip, &peers.channels).is_none());
    }

    #[test]
    fn test_send_errors_count_as_failed() {
        let link = Arc::new(RecordingLink {
            id: LinkId::next(),
            open: true,
            fail_send: true,
            frames: Mutex::new(Vec::new()),
        });
        let channels = vec![PeerChannel { id: NodeId::from("node_b"), link }];
        let mut manager = manager(BroadcastPolicyKind::BroadcastAll);

        let report = manager.broadcast(&channels, envelope(1), &BroadcastOptions::default());
        assert_eq!((report.sent, report.failed), (0, 1));
        assert_eq!(manager.stats().success_rate(), Some(0.0));
        manager.reset_stats();
        assert_eq!(manager.stats().success_rate(), None);
    }

    #[test]
    fn test_policy_names() {
        for name in ["broadcast-all", "selective", "gossip", "priority", "batch"] {
            let kind: BroadcastPolicyKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("flood".parse::<BroadcastPolicyKind>().is_err());
    }
}
