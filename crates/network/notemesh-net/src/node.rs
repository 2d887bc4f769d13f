//! Node actor.
//!
//! A [`Node`] owns every piece of per-process state: the negotiation
//! coordinator, the replica, the sync protocol, the dissemination manager
//! and the persistence gateway. [`spawn`] runs it as a single task that
//! processes one input at a time, so none of that state needs locking.
//! Nothing on that task waits on a peer: negotiation I/O runs on the
//! coordinator's per-session drivers and comes back as events.

use crate::config::NodeConfig;
use crate::coordinator::{CoordinatorStats, LinkNotice, PeerConnectionCoordinator, PeerEvent, PeerStatus};
use crate::dissemination::{BroadcastManager, BroadcastOptions, BroadcastPolicyKind, BroadcastReport, BroadcastStats};
use crate::error::{NetworkError, Result, TransportError};
use crate::protocol::{Envelope, StrategyConfig, StrategyType, WireMessage};
use crate::sync::{SyncProtocol, SyncStats};
use crate::transport::{PeerTransport, SignalingLink};
use crate::types::{EventReceiver, EventSender, NodeEvent};
use notemesh_replica::{
    ConflictPolicyKind, NodeId, NoteId, NoteRecord, PersistenceGateway, ReplicaError, ReplicaStore, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of a local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Record as stored after the mutation
    pub note: Option<NoteRecord>,
    /// A delete removed a present record
    pub removed: bool,
    /// The snapshot was saved
    pub persisted: bool,
    pub report: BroadcastReport,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub notes: usize,
    pub connected_peers: usize,
    pub conflict_policy: ConflictPolicyKind,
    pub broadcast_policy: BroadcastPolicyKind,
    pub coordinator: CoordinatorStats,
    pub sync: SyncStats,
    pub broadcast: BroadcastStats,
    pub broadcast_success_rate: Option<f64>,
}

/// One replica of the note collection and its peer links.
pub struct Node {
    local_id: NodeId,
    config: NodeConfig,
    coordinator: PeerConnectionCoordinator,
    store: ReplicaStore,
    sync: SyncProtocol,
    broadcast: BroadcastManager,
    persistence: Arc<dyn PersistenceGateway>,
    /// Policies each connected peer last announced
    peer_strategies: HashMap<NodeId, StrategyConfig>,
}

impl Node {
    /// Builds a node and loads its persisted snapshot.
    ///
    /// `events` must feed the receiver later passed to [`spawn`]; links and
    /// retry timers report through it.
    pub fn new(
        config: NodeConfig,
        local_id: NodeId,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingLink>,
        events: EventSender,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Result<Self> {
        config.validate()?;

        let store = match persistence.load(&config.storage_key) {
            Ok(Some(records)) => {
                info!(node = %local_id, notes = records.len(), backend = persistence.name(), "loaded snapshot");
                ReplicaStore::from_records(records)
            }
            Ok(None) => ReplicaStore::new(),
            Err(e) => {
                NetworkError::from(e).report("snapshot load failed, starting empty");
                ReplicaStore::new()
            }
        };

        let coordinator = PeerConnectionCoordinator::new(
            local_id.clone(),
            transport,
            signaling,
            events,
            config.negotiation.clone(),
        );
        let sync = SyncProtocol::new(local_id.clone(), &config.sync);
        let broadcast = BroadcastManager::new(config.dissemination.clone());

        Ok(Self {
            local_id,
            config,
            coordinator,
            store,
            sync,
            broadcast,
            persistence,
            peer_strategies: HashMap::new(),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Feeds one relay, transport or timer event through the coordinator.
    pub fn handle_event(&mut self, event: NodeEvent) {
        for peer_event in PeerEvent::from_node_event(event) {
            if let Some(notice) = self.coordinator.handle_event(peer_event) {
                self.handle_notice(notice);
            }
        }
    }

    fn handle_notice(&mut self, notice: LinkNotice) {
        match notice {
            LinkNotice::Opened { peer, initiator } => {
                info!(%peer, initiator, "peer channel open");
                self.send_direct(&peer, self.strategy_announcement());
                if initiator {
                    if let Some(message) = self.sync.begin_full_sync(&peer, &self.store) {
                        self.send_direct(&peer, message);
                    }
                }
            }
            LinkNotice::Closed { peer } => {
                info!(%peer, "peer channel closed");
                self.sync.clear_marker(&peer);
                self.peer_strategies.remove(&peer);
            }
            LinkNotice::Message { peer, data } => match Envelope::decode(&peer, &data) {
                Ok(envelope) => self.handle_envelope(&peer, envelope),
                Err(e) => e.report("dropping malformed message"),
            },
        }
    }

    fn handle_envelope(&mut self, peer: &NodeId, envelope: Envelope) {
        if envelope.gossip {
            if let Some(id) = &envelope.id {
                if !self.broadcast.observe_gossip(id) {
                    debug!(%peer, message = %id, "duplicate gossip dropped");
                    return;
                }
            }
            let channels = self.coordinator.peer_channels();
            self.broadcast.forward_gossip(&channels, &envelope, peer);
        }

        debug!(%peer, kind = envelope.message.kind(), "received message");
        match envelope.message {
            WireMessage::SyncAll { notes, is_response, .. } => {
                let (report, reply) = self.sync.handle_full_state(peer, notes, is_response, &mut self.store);
                if report.changed() {
                    self.persist();
                }
                if let Some(reply) = reply {
                    self.send_direct(peer, reply);
                }
            }
            WireMessage::NoteCreated { note } | WireMessage::NoteUpdated { note } => {
                if self.sync.apply_remote_note(&mut self.store, note).changed() {
                    self.persist();
                }
            }
            WireMessage::NoteDeleted { note_id, .. } => {
                if self.sync.apply_remote_delete(&mut self.store, &note_id) {
                    self.persist();
                }
            }
            WireMessage::StrategyConfig { config, .. } => self.record_peer_strategy(peer, config),
            WireMessage::StrategyChangeRequest {
                strategy_type,
                strategy_name,
                ..
            } => self.handle_strategy_change(peer, strategy_type, &strategy_name),
            WireMessage::Batch { messages, .. } => {
                debug!(%peer, count = messages.len(), "unpacking batch");
                for message in messages {
                    self.handle_envelope(peer, message);
                }
            }
        }
    }

    fn record_peer_strategy(&mut self, peer: &NodeId, config: StrategyConfig) {
        let ours = self.strategy_config();
        if config != ours {
            warn!(
                %peer,
                peer_conflict = %config.conflict,
                peer_broadcast = %config.broadcast,
                conflict = %ours.conflict,
                broadcast = %ours.broadcast,
                "peer runs different policies"
            );
        }
        self.peer_strategies.insert(peer.clone(), config);
    }

    fn handle_strategy_change(&mut self, peer: &NodeId, strategy_type: StrategyType, name: &str) {
        if !self.config.sync.accept_remote_strategy_changes {
            info!(%peer, %strategy_type, name, "ignoring remote strategy change");
            return;
        }
        info!(%peer, %strategy_type, name, "applying remote strategy change");
        if let Err(e) = self.apply_strategy(strategy_type, name) {
            e.report("rejected strategy change request");
        }
    }

    fn apply_strategy(&mut self, strategy_type: StrategyType, name: &str) -> Result<()> {
        match strategy_type {
            StrategyType::Conflict => self.set_conflict_policy(name.parse()?),
            StrategyType::Broadcast => {
                self.set_broadcast_policy(name.parse()?);
            }
        }
        Ok(())
    }

    fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig::new(self.sync.conflict_policy(), self.broadcast.policy_kind())
    }

    fn strategy_announcement(&self) -> WireMessage {
        WireMessage::StrategyConfig {
            config: self.strategy_config(),
            from: self.local_id.clone(),
        }
    }

    fn announce_strategy(&self) {
        for peer in self.coordinator.connected_peers() {
            self.send_direct(&peer, self.strategy_announcement());
        }
    }

    /// Sends a point-to-point message on `peer`'s open channel.
    fn send_direct(&self, peer: &NodeId, message: WireMessage) -> bool {
        let Some(channel) = self.coordinator.channel(peer) else {
            NetworkError::UnknownPeer(peer.clone()).report("no open channel for direct message");
            return false;
        };
        let result = Envelope::direct(message)
            .encode()
            .and_then(|frame| channel.send(&frame));
        match result {
            Ok(()) => true,
            Err(e) => {
                e.report("direct send failed");
                false
            }
        }
    }

    fn disseminate(&mut self, message: WireMessage) -> BroadcastReport {
        let channels = self.coordinator.peer_channels();
        self.broadcast
            .broadcast(&channels, Envelope::new(message), &BroadcastOptions::default())
    }

    fn persist(&self) -> bool {
        match self.persistence.save(&self.config.storage_key, &self.store.snapshot()) {
            Ok(()) => true,
            Err(e) => {
                NetworkError::from(e).report("snapshot save failed");
                false
            }
        }
    }

    /// Creates a note authored by this node and disseminates it.
    pub fn create_note(&mut self, title: impl Into<String>, body: impl Into<String>) -> MutationOutcome {
        let note = NoteRecord::create(&self.local_id, title, body);
        self.store.upsert(note.clone());
        let persisted = self.persist();
        let report = self.disseminate(WireMessage::NoteCreated { note: note.clone() });
        MutationOutcome {
            note: Some(note),
            removed: false,
            persisted,
            report,
        }
    }

    /// Replaces a note's content with a new local revision.
    pub fn update_note(
        &mut self,
        id: &NoteId,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<MutationOutcome> {
        let current = self.store.get(id).ok_or_else(|| ReplicaError::NoteNotFound {
            id: id.as_str().to_string(),
        })?;
        let note = current.revised(title, body);
        self.store.upsert(note.clone());
        let persisted = self.persist();
        let report = self.disseminate(WireMessage::NoteUpdated { note: note.clone() });
        Ok(MutationOutcome {
            note: Some(note),
            removed: false,
            persisted,
            report,
        })
    }

    /// Removes a note if present; the delete is disseminated either way.
    pub fn delete_note(&mut self, id: &NoteId) -> MutationOutcome {
        let removed = self.store.remove(id).is_some();
        let persisted = self.persist();
        let report = self.disseminate(WireMessage::NoteDeleted {
            note_id: id.clone(),
            from: self.local_id.clone(),
            timestamp: Timestamp::now(),
        });
        MutationOutcome {
            note: None,
            removed,
            persisted,
            report,
        }
    }

    pub fn set_conflict_policy(&mut self, kind: ConflictPolicyKind) {
        info!(node = %self.local_id, policy = %kind, "conflict policy set");
        self.sync.set_policy(kind);
        self.announce_strategy();
    }

    /// Switches dissemination policy; returns the flush of a pending batch.
    pub fn set_broadcast_policy(&mut self, kind: BroadcastPolicyKind) -> Option<BroadcastReport> {
        let channels = self.coordinator.peer_channels();
        let flushed = self.broadcast.set_policy_kind(kind, &channels);
        self.announce_strategy();
        flushed
    }

    pub fn set_peer_priority(&mut self, peer: NodeId, priority: u8) {
        self.broadcast.set_peer_priority(peer, priority);
    }

    /// Asks every connected peer to switch a policy; returns how many were asked.
    pub fn request_strategy_change(&self, strategy_type: StrategyType, name: &str) -> Result<usize> {
        match strategy_type {
            StrategyType::Conflict => {
                name.parse::<ConflictPolicyKind>()?;
            }
            StrategyType::Broadcast => {
                name.parse::<BroadcastPolicyKind>()?;
            }
        }

        let mut asked = 0;
        for peer in self.coordinator.connected_peers() {
            let request = WireMessage::StrategyChangeRequest {
                strategy_type,
                strategy_name: name.to_string(),
                from: self.local_id.clone(),
            };
            if self.send_direct(&peer, request) {
                asked += 1;
            }
        }
        Ok(asked)
    }

    /// All notes ordered by id.
    pub fn notes(&self) -> Vec<NoteRecord> {
        self.store.snapshot()
    }

    pub fn note(&self, id: &NoteId) -> Option<NoteRecord> {
        self.store.get(id).cloned()
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.coordinator.connected_peers()
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.coordinator.peer_status()
    }

    /// Policies announced by `peer`, if any.
    pub fn peer_strategy(&self, peer: &NodeId) -> Option<&StrategyConfig> {
        self.peer_strategies.get(peer)
    }

    pub fn stats(&self) -> NodeStats {
        let broadcast = self.broadcast.stats();
        NodeStats {
            node_id: self.local_id.clone(),
            notes: self.store.len(),
            connected_peers: self.coordinator.connected_peers().len(),
            conflict_policy: self.sync.conflict_policy(),
            broadcast_policy: self.broadcast.policy_kind(),
            coordinator: self.coordinator.stats(),
            sync: self.sync.stats(),
            broadcast,
            broadcast_success_rate: broadcast.success_rate(),
        }
    }

    /// When the pending batch must go out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.broadcast.next_deadline()
    }

    /// Flushes the pending batch if its deadline has passed.
    pub fn flush_due(&mut self, now: Instant) -> Option<BroadcastReport> {
        let channels = self.coordinator.peer_channels();
        self.broadcast.poll_timers(now, &channels)
    }

    /// Flushes pending messages and closes every peer link.
    pub async fn shutdown(&mut self) {
        if self.broadcast.queued() > 0 {
            let channels = self.coordinator.peer_channels();
            self.broadcast.flush_due(&channels);
        }
        for notice in self.coordinator.shutdown().await {
            self.handle_notice(notice);
        }
        info!(node = %self.local_id, "node shut down");
    }
}

enum Command {
    CreateNote {
        title: String,
        body: String,
        reply: oneshot::Sender<MutationOutcome>,
    },
    UpdateNote {
        id: NoteId,
        title: String,
        body: String,
        reply: oneshot::Sender<Result<MutationOutcome>>,
    },
    DeleteNote {
        id: NoteId,
        reply: oneshot::Sender<MutationOutcome>,
    },
    Notes {
        reply: oneshot::Sender<Vec<NoteRecord>>,
    },
    Note {
        id: NoteId,
        reply: oneshot::Sender<Option<NoteRecord>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    PeerStatus {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
    PeerStrategy {
        peer: NodeId,
        reply: oneshot::Sender<Option<StrategyConfig>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    SetConflictPolicy {
        kind: ConflictPolicyKind,
        reply: oneshot::Sender<()>,
    },
    SetBroadcastPolicy {
        kind: BroadcastPolicyKind,
        reply: oneshot::Sender<Option<BroadcastReport>>,
    },
    SetPeerPriority {
        peer: NodeId,
        priority: u8,
        reply: oneshot::Sender<()>,
    },
    RequestStrategyChange {
        strategy_type: StrategyType,
        name: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Node {
    fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::CreateNote { title, body, reply } => {
                let _ = reply.send(self.create_note(title, body));
            }
            Command::UpdateNote { id, title, body, reply } => {
                let _ = reply.send(self.update_note(&id, title, body));
            }
            Command::DeleteNote { id, reply } => {
                let _ = reply.send(self.delete_note(&id));
            }
            Command::Notes { reply } => {
                let _ = reply.send(self.notes());
            }
            Command::Note { id, reply } => {
                let _ = reply.send(self.note(&id));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.connected_peers());
            }
            Command::PeerStatus { reply } => {
                let _ = reply.send(self.peer_status());
            }
            Command::PeerStrategy { peer, reply } => {
                let _ = reply.send(self.peer_strategy(&peer).cloned());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::SetConflictPolicy { kind, reply } => {
                self.set_conflict_policy(kind);
                let _ = reply.send(());
            }
            Command::SetBroadcastPolicy { kind, reply } => {
                let _ = reply.send(self.set_broadcast_policy(kind));
            }
            Command::SetPeerPriority { peer, priority, reply } => {
                self.set_peer_priority(peer, priority);
                let _ = reply.send(());
            }
            Command::RequestStrategyChange {
                strategy_type,
                name,
                reply,
            } => {
                let _ = reply.send(self.request_strategy_change(strategy_type, &name));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs `node` on its own task and returns a handle to it.
pub fn spawn(mut node: Node, mut events: EventReceiver) -> NodeHandle {
    let (commands_tx, mut commands) = mpsc::channel::<Command>(64);
    let local_id = node.local_id().clone();

    tokio::spawn(async move {
        loop {
            let deadline = node.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => node.handle_event(event),
                    None => {
                        info!(node = %node.local_id(), "event channel closed, stopping node");
                        node.shutdown().await;
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        node.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => node.handle_command(command),
                    None => {
                        node.shutdown().await;
                        break;
                    }
                },
                _ = wait_until(deadline) => {
                    node.flush_due(Instant::now());
                }
            }
        }
    });

    NodeHandle {
        local_id,
        commands: commands_tx,
    }
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    local_id: NodeId,
    commands: mpsc::Sender<Command>,
}

fn stopped() -> NetworkError {
    NetworkError::Transport(TransportError::ChannelClosed("node is not running".to_string()))
}

impl NodeHandle {
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn create_note(&self, title: impl Into<String>, body: impl Into<String>) -> Result<MutationOutcome> {
        let (title, body) = (title.into(), body.into());
        self.request(|reply| Command::CreateNote { title, body, reply }).await
    }

    pub async fn update_note(
        &self,
        id: NoteId,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<MutationOutcome> {
        let (title, body) = (title.into(), body.into());
        self.request(|reply| Command::UpdateNote { id, title, body, reply })
            .await?
    }

    pub async fn delete_note(&self, id: NoteId) -> Result<MutationOutcome> {
        self.request(|reply| Command::DeleteNote { id, reply }).await
    }

    pub async fn notes(&self) -> Result<Vec<NoteRecord>> {
        self.request(|reply| Command::Notes { reply }).await
    }

    pub async fn note(&self, id: NoteId) -> Result<Option<NoteRecord>> {
        self.request(|reply| Command::Note { id, reply }).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<NodeId>> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    pub async fn peer_status(&self) -> Result<Vec<PeerStatus>> {
        self.request(|reply| Command::PeerStatus { reply }).await
    }

    pub async fn peer_strategy(&self, peer: NodeId) -> Result<Option<StrategyConfig>> {
        self.request(|reply| Command::PeerStrategy { peer, reply }).await
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn set_conflict_policy(&self, kind: ConflictPolicyKind) -> Result<()> {
        self.request(|reply| Command::SetConflictPolicy { kind, reply }).await
    }

    pub async fn set_broadcast_policy(&self, kind: BroadcastPolicyKind) -> Result<Option<BroadcastReport>> {
        self.request(|reply| Command::SetBroadcastPolicy { kind, reply }).await
    }

    pub async fn set_peer_priority(&self, peer: NodeId, priority: u8) -> Result<()> {
        self.request(|reply| Command::SetPeerPriority { peer, priority, reply })
            .await
    }

    pub async fn request_strategy_change(&self, strategy_type: StrategyType, name: impl Into<String>) -> Result<usize> {
        let name = name.into();
        self.request(|reply| Command::RequestStrategyChange {
            strategy_type,
            name,
            reply,
        })
        .await?
    }

    /// Stops the node after flushing and closing its links.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::NegotiationPhase;
    use crate::transport::MemoryNetwork;
    use crate::types::{event_channel, SignalPayload};
    use async_trait::async_trait;
    use std::time::Duration;
    use notemesh_replica::{MemorySnapshotStore, StorageError, StorageResult};

    struct FailingStore;

    impl PersistenceGateway for FailingStore {
        fn save(&self, _key: &str, _records: &[NoteRecord]) -> StorageResult<()> {
            Err(StorageError::Unavailable("disk full".into()))
        }
        fn load(&self, _key: &str) -> StorageResult<Option<Vec<NoteRecord>>> {
            Err(StorageError::Unavailable("disk full".into()))
        }
        fn clear(&self) -> StorageResult<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    /// Relay whose sends never complete.
    struct StalledRelay;

    #[async_trait]
    impl SignalingLink for StalledRelay {
        async fn send_signal(&self, _to: &NodeId, _signal: SignalPayload) -> Result<()> {
            std::future::pending().await
        }
    }

    fn isolated_node(persistence: Arc<dyn PersistenceGateway>) -> Node {
        let network = MemoryNetwork::new();
        let id = NodeId::from("node_a");
        let (tx, _rx) = event_channel();
        let (relay, transport) = network.join(&id, tx.clone());
        Node::new(NodeConfig::default(), id, transport, relay, tx, persistence).unwrap()
    }

    #[tokio::test]
    async fn test_local_mutations_persist_and_report() {
        let persistence = Arc::new(MemorySnapshotStore::new());
        let mut node = isolated_node(persistence.clone());

        let created = node.create_note("Groceries", "milk");
        assert!(created.persisted);
        assert_eq!(created.report.total, 0);
        let id = created.note.unwrap().id;

        let updated = node.update_note(&id, "Groceries", "milk, eggs").unwrap();
        let note = updated.note.unwrap();
        assert_eq!(note.version, Some(2));
        assert_eq!(node.note(&id).unwrap().body, "milk, eggs");

        let saved = persistence.load("notemesh-notes").unwrap().unwrap();
        assert_eq!(saved, vec![note]);

        let deleted = node.delete_note(&id);
        assert!(deleted.removed);
        assert!(node.notes().is_empty());
        assert!(!node.delete_note(&id).removed);
    }

    #[tokio::test]
    async fn test_update_unknown_note_fails() {
        let mut node = isolated_node(Arc::new(MemorySnapshotStore::new()));
        let err = node.update_note(&NoteId::from("missing"), "t", "b").unwrap_err();
        assert!(matches!(err, NetworkError::Replica(ReplicaError::NoteNotFound { .. })));
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_memory_state() {
        let mut node = isolated_node(Arc::new(FailingStore));
        let outcome = node.create_note("t", "b");
        assert!(!outcome.persisted);
        assert_eq!(node.notes().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_loaded_on_start() {
        let persistence = Arc::new(MemorySnapshotStore::new());
        let note = NoteRecord::create(&NodeId::from("node_z"), "kept", "across restarts");
        persistence.save("notemesh-notes", std::slice::from_ref(&note)).unwrap();

        let node = isolated_node(persistence);
        assert_eq!(node.notes(), vec![note]);
    }

    #[tokio::test]
    async fn test_policy_changes_show_in_stats() {
        let mut node = isolated_node(Arc::new(MemorySnapshotStore::new()));
        node.set_conflict_policy(ConflictPolicyKind::VersionBased);
        assert!(node.set_broadcast_policy(BroadcastPolicyKind::Gossip).is_none());

        let stats = node.stats();
        assert_eq!(stats.conflict_policy, ConflictPolicyKind::VersionBased);
        assert_eq!(stats.broadcast_policy, BroadcastPolicyKind::Gossip);
        assert!(node
            .request_strategy_change(StrategyType::Conflict, "newest-wins")
            .is_err());
        assert_eq!(node.request_strategy_change(StrategyType::Broadcast, "batch").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_fails() {
        let network = MemoryNetwork::new();
        let id = NodeId::from("node_a");
        let (tx, rx) = event_channel();
        let (relay, transport) = network.join(&id, tx.clone());
        let node = Node::new(
            NodeConfig::default(),
            id,
            transport,
            relay,
            tx,
            Arc::new(MemorySnapshotStore::new()),
        )
        .unwrap();

        let handle = spawn(node, rx);
        handle.create_note("t", "b").await.unwrap();
        assert_eq!(handle.notes().await.unwrap().len(), 1);
        handle.shutdown().await.unwrap();
        assert!(handle.notes().await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_relay_does_not_block_commands() {
        let network = MemoryNetwork::new();
        let id = NodeId::from("node_a");
        let (tx, rx) = event_channel();
        let (_relay, transport) = network.join(&id, tx.clone());
        let node = Node::new(
            NodeConfig::default(),
            id,
            transport,
            Arc::new(StalledRelay),
            tx,
            Arc::new(MemorySnapshotStore::new()),
        )
        .unwrap();
        let handle = spawn(node, rx);

        let (tx_b, _rx_b) = event_channel();
        let _node_b = network.join(&NodeId::from("node_b"), tx_b);

        let status = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let status = handle.peer_status().await.unwrap();
                if !status.is_empty() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer never registered");
        assert_eq!(status[0].id, NodeId::from("node_b"));
        assert_eq!(status[0].phase, NegotiationPhase::Offering);

        let created = tokio::time::timeout(Duration::from_secs(1), handle.create_note("t", "b"))
            .await
            .expect("command blocked behind signaling")
            .unwrap();
        assert!(created.note.is_some());
        assert_eq!(handle.notes().await.unwrap().len(), 1);

        handle.shutdown().await.unwrap();
    }
}
