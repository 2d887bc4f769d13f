//! Replica synchronization protocol.
//!
//! On channel open the initiating side sends its full state. The receiver
//! merges it and answers once with its own state tagged as a response, which
//! never triggers a further reply. A per-peer marker set whenever a full state
//! goes out suppresses duplicate full syncs to the same peer for a short
//! window.

use crate::config::SyncConfig;
use crate::protocol::WireMessage;
use notemesh_replica::{
    ConflictPolicyKind, ConflictResolver, MergeOutcome, MergeReport, NodeId, NoteId, NoteRecord,
    ReplicaStore, Timestamp,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Sync counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub full_syncs_sent: u64,
    pub full_syncs_received: u64,
    pub notes_inserted: u64,
    pub notes_replaced: u64,
    pub notes_unchanged: u64,
    pub deletes_applied: u64,
}

impl SyncStats {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.notes_inserted += 1,
            MergeOutcome::Replaced => self.notes_replaced += 1,
            MergeOutcome::Unchanged => self.notes_unchanged += 1,
        }
    }

    fn absorb(&mut self, report: &MergeReport) {
        self.notes_inserted += report.inserted as u64;
        self.notes_replaced += report.replaced as u64;
        self.notes_unchanged += report.unchanged as u64;
    }
}

/// Reconciles remote state into a [`ReplicaStore`].
pub struct SyncProtocol {
    local_id: NodeId,
    resolver: ConflictResolver,
    /// Peers that were sent a full state recently
    markers: HashMap<NodeId, Instant>,
    marker_window: Duration,
    stats: SyncStats,
}

impl SyncProtocol {
    pub fn new(local_id: NodeId, config: &SyncConfig) -> Self {
        let resolver = ConflictResolver::new(config.conflict_policy.build(&local_id));
        Self {
            local_id,
            resolver,
            markers: HashMap::new(),
            marker_window: config.marker_window(),
            stats: SyncStats::default(),
        }
    }

    pub fn conflict_policy(&self) -> ConflictPolicyKind {
        self.resolver.policy().kind()
    }

    /// Swaps the conflict policy; later merges use the new one.
    pub fn set_policy(&mut self, kind: ConflictPolicyKind) {
        self.resolver.set_policy(kind.build(&self.local_id));
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Whether a full state went to `peer` within the marker window.
    pub fn marker_live(&self, peer: &NodeId) -> bool {
        self.markers
            .get(peer)
            .is_some_and(|sent| sent.elapsed() < self.marker_window)
    }

    pub fn clear_marker(&mut self, peer: &NodeId) {
        self.markers.remove(peer);
    }

    fn full_state(&mut self, peer: &NodeId, store: &ReplicaStore, is_response: bool) -> WireMessage {
        self.markers.insert(peer.clone(), Instant::now());
        self.stats.full_syncs_sent += 1;
        let notes = store.snapshot();
        debug!(%peer, notes = notes.len(), is_response, "sending full state");
        WireMessage::SyncAll {
            notes,
            from: self.local_id.clone(),
            timestamp: Timestamp::now(),
            is_response,
        }
    }

    /// Unsolicited full state for a freshly opened channel, unless one was sent recently.
    pub fn begin_full_sync(&mut self, peer: &NodeId, store: &ReplicaStore) -> Option<WireMessage> {
        if self.marker_live(peer) {
            debug!(%peer, "full sync already in progress");
            return None;
        }
        Some(self.full_state(peer, store, false))
    }

    /// Merges a received full state and builds the reply, if one is owed.
    ///
    /// Local records missing from `notes` are kept.
    pub fn handle_full_state(
        &mut self,
        peer: &NodeId,
        notes: Vec<NoteRecord>,
        is_response: bool,
        store: &mut ReplicaStore,
    ) -> (MergeReport, Option<WireMessage>) {
        self.stats.full_syncs_received += 1;
        let report = store.merge_all(notes, &self.resolver);
        self.stats.absorb(&report);
        info!(
            %peer,
            inserted = report.inserted,
            replaced = report.replaced,
            unchanged = report.unchanged,
            is_response,
            "merged full state"
        );

        let reply = if is_response || self.marker_live(peer) {
            None
        } else {
            Some(self.full_state(peer, store, true))
        };
        (report, reply)
    }

    /// Applies a single created or updated record.
    pub fn apply_remote_note(&mut self, store: &mut ReplicaStore, note: NoteRecord) -> MergeOutcome {
        let outcome = store.merge_remote(note, &self.resolver);
        self.stats.record(outcome);
        outcome
    }

    /// Removes `id` unconditionally; true if it was present.
    pub fn apply_remote_delete(&mut self, store: &mut ReplicaStore, id: &NoteId) -> bool {
        let removed = store.remove(id).is_some();
        if removed {
            self.stats.deletes_applied += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, body: &str, updated_at: u64, author: &str) -> NoteRecord {
        NoteRecord {
            id: NoteId::from(id),
            title: "shared".into(),
            body: body.into(),
            updated_at: Timestamp::from_millis(updated_at),
            version: Some(1),
            origin_node_id: NodeId::from(author),
            author_node_id: NodeId::from(author),
            merged: false,
        }
    }

    fn protocol(id: &str) -> SyncProtocol {
        SyncProtocol::new(NodeId::from(id), &SyncConfig::default())
    }

    fn notes_of(message: WireMessage) -> (Vec<NoteRecord>, bool) {
        match message {
            WireMessage::SyncAll { notes, is_response, .. } => (notes, is_response),
            other => panic!("expected sync-all, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_full_sync_exchange_converges() {
        let a = NodeId::from("node_a");
        let b = NodeId::from("node_b");
        let mut sync_a = protocol("node_a");
        let mut sync_b = protocol("node_b");
        let mut store_a = ReplicaStore::from_records([note("n1", "draft", 100, "node_a"), note("n2", "only a", 50, "node_a")]);
        let mut store_b = ReplicaStore::from_records([note("n1", "final", 200, "node_b")]);

        let opening = sync_a.begin_full_sync(&b, &store_a).unwrap();
        let (notes, is_response) = notes_of(opening);
        assert!(!is_response);

        let (report, reply) = sync_b.handle_full_state(&a, notes, is_response, &mut store_b);
        assert_eq!((report.inserted, report.replaced, report.unchanged), (1, 0, 1));
        let (notes, is_response) = notes_of(reply.unwrap());
        assert!(is_response);

        let (report, reply) = sync_a.handle_full_state(&b, notes, is_response, &mut store_a);
        assert!(reply.is_none());
        assert_eq!(report.replaced, 1);

        for store in [&store_a, &store_b] {
            let n1 = store.get(&NoteId::from("n1")).unwrap();
            assert_eq!(n1.body, "final");
            assert_eq!(n1.updated_at, Timestamp::from_millis(200));
            assert!(store.contains(&NoteId::from("n2")));
        }
        assert_eq!(sync_a.stats().full_syncs_sent, 1);
        assert_eq!(sync_b.stats().full_syncs_received, 1);
        assert_eq!((sync_b.stats().notes_inserted, sync_b.stats().notes_unchanged), (1, 1));
        assert_eq!(sync_a.stats().notes_replaced, 1);
    }

    #[tokio::test]
    async fn test_response_never_triggers_reply() {
        let mut sync = protocol("node_b");
        let mut store = ReplicaStore::new();
        let (_, reply) = sync.handle_full_state(&NodeId::from("node_a"), vec![], true, &mut store);
        assert!(reply.is_none());
        assert_eq!(sync.stats().full_syncs_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_suppresses_duplicate_full_syncs() {
        let peer = NodeId::from("node_b");
        let mut sync = protocol("node_a");
        let mut store = ReplicaStore::new();

        assert!(sync.begin_full_sync(&peer, &store).is_some());
        assert!(sync.begin_full_sync(&peer, &store).is_none());
        let (_, reply) = sync.handle_full_state(&peer, vec![], false, &mut store);
        assert!(reply.is_none());

        tokio::time::advance(SyncConfig::default().marker_window()).await;
        assert!(!sync.marker_live(&peer));
        assert!(sync.begin_full_sync(&peer, &store).is_some());

        sync.clear_marker(&peer);
        assert!(sync.begin_full_sync(&peer, &store).is_some());
    }

    #[test]
    fn test_remote_delete_is_unconditional() {
        let mut sync = protocol("node_b");
        let mut store = ReplicaStore::from_records([note("n1", "newer local edit", 900, "node_b")]);

        assert!(sync.apply_remote_delete(&mut store, &NoteId::from("n1")));
        assert!(store.is_empty());
        assert!(!sync.apply_remote_delete(&mut store, &NoteId::from("n1")));
        assert_eq!(sync.stats().deletes_applied, 1);
    }

    #[test]
    fn test_policy_switch_changes_resolution() {
        let mut sync = protocol("node_a");
        let mut store = ReplicaStore::from_records([note("n1", "old", 100, "node_a")]);

        sync.set_policy(ConflictPolicyKind::FirstWriteWins);
        assert_eq!(sync.conflict_policy(), ConflictPolicyKind::FirstWriteWins);
        let outcome = sync.apply_remote_note(&mut store, note("n1", "new", 300, "node_b"));
        assert_eq!(outcome, MergeOutcome::Unchanged);

        sync.set_policy(ConflictPolicyKind::LastWriteWins);
        let outcome = sync.apply_remote_note(&mut store, note("n1", "new", 300, "node_b"));
        assert_eq!(outcome, MergeOutcome::Replaced);
        assert_eq!(store.get(&NoteId::from("n1")).unwrap().body, "new");
    }
}
