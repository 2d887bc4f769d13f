//! Core types for replicated notes

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    time::{SystemTime, UNIX_EPOCH},
};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random lowercase base-36 string used for generated identifiers
pub fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Identifier of a node taking part in replication.
///
/// Ordering is plain lexicographic string ordering; the negotiation layer
/// relies on it to break glare deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh node id of the form `node_xxxxxxxxx`
    pub fn generate() -> Self {
        Self(format!("node_{}", random_base36(9)))
    }

    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Globally unique note identifier, assigned once by the originating node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    /// Generate a note id scoped to the creating node
    pub fn generate(origin: &NodeId, now: Timestamp) -> Self {
        Self(format!("note_{}_{}_{}", origin, now.as_millis(), random_base36(5)))
    }

    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Wall-clock "happened-at" marker in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current system time
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Create timestamp from milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Smallest timestamp strictly after `self`
    pub fn successor(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single replicated note.
///
/// Records are replaced whole; there are no partial field updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub id: NoteId,
    pub title: String,
    pub body: String,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub origin_node_id: NodeId,
    pub author_node_id: NodeId,
    /// Set on records synthesized by the content-merge policy
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merged: bool,
}

impl NoteRecord {
    /// Create a fresh record authored and originated by `node`
    pub fn create(node: &NodeId, title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: NoteId::generate(node, now),
            title: title.into(),
            body: body.into(),
            updated_at: now,
            version: Some(1),
            origin_node_id: node.clone(),
            author_node_id: node.clone(),
            merged: false,
        }
    }

    /// Version with a missing value read as 1
    pub fn effective_version(&self) -> u64 {
        self.version.unwrap_or(1)
    }

    /// Produce the next local revision with new content
    pub fn revised(&self, title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Timestamp::now().max(self.updated_at.successor());
        Self {
            id: self.id.clone(),
            title: title.into(),
            body: body.into(),
            updated_at: now,
            version: Some(self.effective_version().saturating_add(1)),
            origin_node_id: self.origin_node_id.clone(),
            author_node_id: self.author_node_id.clone(),
            merged: false,
        }
    }

    /// True when title and body are byte-identical
    pub fn same_content(&self, other: &NoteRecord) -> bool {
        self.title == other.title && self.body == other.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_have_expected_shape() {
        let node = NodeId::generate();
        assert!(node.as_str().starts_with("node_"));
        assert_eq!(node.as_str().len(), 14);

        let note = NoteId::generate(&node, Timestamp::from_millis(42));
        assert!(note.as_str().starts_with(&format!("note_{}_42_", node)));
    }

    #[test]
    fn test_revision_advances_time_and_version() {
        let node = NodeId::from("node_a");
        let mut note = NoteRecord::create(&node, "t", "b");
        note.updated_at = Timestamp::from_millis(u64::MAX / 2);

        let revised = note.revised("t2", "b2");
        assert_eq!(revised.id, note.id);
        assert!(revised.updated_at > note.updated_at);
        assert_eq!(revised.version, Some(2));
        assert_eq!(revised.author_node_id, node);
    }

    #[test]
    fn test_revision_saturates_version() {
        let mut note = NoteRecord::create(&NodeId::from("node_a"), "t", "b");
        note.version = Some(u64::MAX);
        note.updated_at = Timestamp::from_millis(u64::MAX);

        let revised = note.revised("t2", "b2");
        assert_eq!(revised.version, Some(u64::MAX));
        assert_eq!(revised.updated_at, Timestamp::from_millis(u64::MAX));
        assert_eq!(revised.body, "b2");
    }

    #[test]
    fn test_wire_field_names() {
        let note = NoteRecord {
            id: NoteId::from("n1"),
            title: "t".into(),
            body: "b".into(),
            updated_at: Timestamp::from_millis(100),
            version: None,
            origin_node_id: NodeId::from("node_a"),
            author_node_id: NodeId::from("node_a"),
            merged: false,
        };

        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["updatedAt"], 100);
        assert_eq!(json["originNodeId"], "node_a");
        assert!(json.get("version").is_none());
        assert!(json.get("merged").is_none());
    }
}
