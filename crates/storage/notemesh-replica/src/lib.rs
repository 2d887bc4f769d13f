//! # Notemesh Replica
//!
//! Local state for the notemesh replicated note collection.
//!
//! Each node keeps an in-memory [`ReplicaStore`] of [`NoteRecord`]s. Records
//! arriving from peers are inserted when unknown and otherwise passed through
//! the active [`ConflictPolicy`]; the store only changes when the resolved
//! record differs from the local one. Snapshots are written through a
//! [`PersistenceGateway`] after every mutation.
//!
//! ## Conflict policies
//!
//! - **Last-Write-Wins**: larger `updatedAt` wins, ties favor the remote record
//! - **First-Write-Wins**: smaller `updatedAt` wins
//! - **Version-Based**: larger version wins, ties fall back to last-write-wins
//! - **Content-Merge**: divergent content is kept side by side in a new record
//! - **Author-Priority**: notes authored by this node always win locally
//!
//! ## Example
//!
//! ```rust
//! use notemesh_replica::{ConflictResolver, NodeId, NoteRecord, ReplicaStore};
//!
//! let node = NodeId::from("node_a");
//! let mut store = ReplicaStore::new();
//! let note = NoteRecord::create(&node, "Groceries", "milk");
//!
//! let outcome = store.merge_remote(note.clone(), &ConflictResolver::default());
//! assert!(outcome.changed());
//! assert_eq!(store.get(&note.id), Some(&note));
//! ```

pub mod error;
pub mod persistence;
pub mod resolve;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use error::{ReplicaError, Result, StorageError};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistenceGateway, StorageResult};
pub use resolve::{ConflictPolicy, ConflictPolicyKind, ConflictResolver};
pub use store::{MergeOutcome, MergeReport, ReplicaStore};
pub use types::{random_base36, NodeId, NoteId, NoteRecord, Timestamp};
