//! In-memory replica of the note collection

use crate::{
    resolve::ConflictResolver,
    types::{NoteId, NoteRecord},
};
use std::collections::HashMap;
use tracing::debug;

/// Result of applying one remote record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Record was absent locally and has been inserted
    Inserted,
    /// Resolution produced a different record which replaced the local one
    Replaced,
    /// Resolution kept the local record as it was
    Unchanged,
}

impl MergeOutcome {
    /// Whether the replica changed
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

/// Counts for a batch of merged records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
}

impl MergeReport {
    /// Record one outcome
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Replaced => self.replaced += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Whether any record changed
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

/// Authoritative local state: note id to record
#[derive(Debug, Clone, Default)]
pub struct ReplicaStore {
    notes: HashMap<NoteId, NoteRecord>,
}

impl ReplicaStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a persisted snapshot; later duplicates win
    pub fn from_records(records: impl IntoIterator<Item = NoteRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.upsert(record);
        }
        store
    }

    /// Look up a record
    pub fn get(&self, id: &NoteId) -> Option<&NoteRecord> {
        self.notes.get(id)
    }

    /// Whether the id is present
    pub fn contains(&self, id: &NoteId) -> bool {
        self.notes.contains_key(id)
    }

    /// Insert or replace a record unconditionally
    pub fn upsert(&mut self, record: NoteRecord) -> Option<NoteRecord> {
        self.notes.insert(record.id.clone(), record)
    }

    /// Remove a record unconditionally.
    ///
    /// No tombstone is kept, so a later full state from a peer that still
    /// holds the record inserts it again.
    pub fn remove(&mut self, id: &NoteId) -> Option<NoteRecord> {
        self.notes.remove(id)
    }

    /// Insert if absent, otherwise resolve and replace only on difference
    pub fn merge_remote(&mut self, remote: NoteRecord, resolver: &ConflictResolver) -> MergeOutcome {
        let Some(local) = self.notes.get(&remote.id) else {
            debug!(note = %remote.id, "inserting remote note");
            self.notes.insert(remote.id.clone(), remote);
            return MergeOutcome::Inserted;
        };

        match resolver.resolve(Some(local), Some(&remote)) {
            Some(winner) if &winner != local => {
                debug!(note = %remote.id, policy = resolver.policy().name(), "remote resolution replaced local note");
                self.notes.insert(winner.id.clone(), winner);
                MergeOutcome::Replaced
            }
            _ => MergeOutcome::Unchanged,
        }
    }

    /// Merge a whole remote set; locally held records missing from it are kept
    pub fn merge_all(&mut self, remote: impl IntoIterator<Item = NoteRecord>, resolver: &ConflictResolver) -> MergeReport {
        let mut report = MergeReport::default();
        for record in remote {
            report.record(self.merge_remote(record, resolver));
        }
        report
    }

    /// Every record, ordered by id
    pub fn snapshot(&self) -> Vec<NoteRecord> {
        let mut records: Vec<NoteRecord> = self.notes.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.notes.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}
