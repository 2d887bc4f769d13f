//! Conflict resolution policies
//!
//! Every policy is a pure function of `(local, remote)`. When only one side is
//! present it is returned unchanged, so callers can feed insert-or-resolve
//! paths through the same entry point.

use crate::{
    error::{ReplicaError, Result},
    types::{NodeId, NoteRecord},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::debug;

/// Label prefixed to the local body in a merged record
pub const LOCAL_SECTION: &str = "=== LOCAL VERSION ===";
/// Label prefixed to the remote body in a merged record
pub const REMOTE_SECTION: &str = "=== REMOTE VERSION ===";
/// Separator between the two titles of a merged record
pub const TITLE_SEPARATOR: &str = " / ";

/// Serializable name of a conflict policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicyKind {
    #[default]
    LastWriteWins,
    FirstWriteWins,
    VersionBased,
    ContentMerge,
    AuthorPriority,
}

impl ConflictPolicyKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicyKind::LastWriteWins => "last-write-wins",
            ConflictPolicyKind::FirstWriteWins => "first-write-wins",
            ConflictPolicyKind::VersionBased => "version-based",
            ConflictPolicyKind::ContentMerge => "content-merge",
            ConflictPolicyKind::AuthorPriority => "author-priority",
        }
    }

    /// Build the policy for a node
    pub fn build(self, self_id: &NodeId) -> ConflictPolicy {
        match self {
            ConflictPolicyKind::LastWriteWins => ConflictPolicy::LastWriteWins,
            ConflictPolicyKind::FirstWriteWins => ConflictPolicy::FirstWriteWins,
            ConflictPolicyKind::VersionBased => ConflictPolicy::VersionBased,
            ConflictPolicyKind::ContentMerge => ConflictPolicy::ContentMerge,
            ConflictPolicyKind::AuthorPriority => ConflictPolicy::AuthorPriority {
                self_id: self_id.clone(),
            },
        }
    }
}

impl fmt::Display for ConflictPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicyKind {
    type Err = ReplicaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last-write-wins" => Ok(ConflictPolicyKind::LastWriteWins),
            "first-write-wins" => Ok(ConflictPolicyKind::FirstWriteWins),
            "version-based" => Ok(ConflictPolicyKind::VersionBased),
            "content-merge" => Ok(ConflictPolicyKind::ContentMerge),
            "author-priority" => Ok(ConflictPolicyKind::AuthorPriority),
            other => Err(ReplicaError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Conflict resolution policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Larger `updatedAt` wins, exact tie favors remote
    LastWriteWins,
    /// Smaller `updatedAt` wins
    FirstWriteWins,
    /// Larger version wins, tie falls back to last-write-wins
    VersionBased,
    /// Identical content falls back to last-write-wins, otherwise both sides are kept
    ContentMerge,
    /// Locally authored notes win, then self-consistent remote notes
    AuthorPriority { self_id: NodeId },
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::LastWriteWins
    }
}

impl ConflictPolicy {
    /// Resolve a `(local, remote)` pair into the winning record
    pub fn resolve(&self, local: Option<&NoteRecord>, remote: Option<&NoteRecord>) -> Option<NoteRecord> {
        match (local, remote) {
            (None, None) => None,
            (Some(local), None) => Some(local.clone()),
            (None, Some(remote)) => Some(remote.clone()),
            (Some(local), Some(remote)) => Some(self.resolve_pair(local, remote)),
        }
    }

    /// Resolve when both sides are present
    pub fn resolve_pair(&self, local: &NoteRecord, remote: &NoteRecord) -> NoteRecord {
        match self {
            ConflictPolicy::LastWriteWins => last_write_wins(local, remote).clone(),
            ConflictPolicy::FirstWriteWins => {
                if local.updated_at < remote.updated_at {
                    local.clone()
                } else {
                    remote.clone()
                }
            }
            ConflictPolicy::VersionBased => {
                let local_version = local.effective_version();
                let remote_version = remote.effective_version();
                if remote_version > local_version {
                    remote.clone()
                } else if local_version > remote_version {
                    local.clone()
                } else {
                    last_write_wins(local, remote).clone()
                }
            }
            ConflictPolicy::ContentMerge => {
                if local.same_content(remote) {
                    return last_write_wins(local, remote).clone();
                }
                debug!(note = %local.id, "merging divergent note content");
                merge_content(local, remote)
            }
            ConflictPolicy::AuthorPriority { self_id } => {
                if &local.author_node_id == self_id {
                    local.clone()
                } else if remote.author_node_id == remote.origin_node_id {
                    remote.clone()
                } else {
                    last_write_wins(local, remote).clone()
                }
            }
        }
    }

    /// Serializable kind
    pub fn kind(&self) -> ConflictPolicyKind {
        match self {
            ConflictPolicy::LastWriteWins => ConflictPolicyKind::LastWriteWins,
            ConflictPolicy::FirstWriteWins => ConflictPolicyKind::FirstWriteWins,
            ConflictPolicy::VersionBased => ConflictPolicyKind::VersionBased,
            ConflictPolicy::ContentMerge => ConflictPolicyKind::ContentMerge,
            ConflictPolicy::AuthorPriority { .. } => ConflictPolicyKind::AuthorPriority,
        }
    }

    /// Human readable name
    pub fn name(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "Last-Write-Wins",
            ConflictPolicy::FirstWriteWins => "First-Write-Wins",
            ConflictPolicy::VersionBased => "Version-Based",
            ConflictPolicy::ContentMerge => "Content-Merge",
            ConflictPolicy::AuthorPriority { .. } => "Author-Priority",
        }
    }
}

fn last_write_wins<'a>(local: &'a NoteRecord, remote: &'a NoteRecord) -> &'a NoteRecord {
    if local.updated_at > remote.updated_at {
        local
    } else {
        remote
    }
}

fn merge_content(local: &NoteRecord, remote: &NoteRecord) -> NoteRecord {
    let title = if local.title == remote.title {
        local.title.clone()
    } else {
        format!("{}{}{}", local.title, TITLE_SEPARATOR, remote.title)
    };
    let body = if local.body == remote.body {
        local.body.clone()
    } else {
        format!("{}\n{}\n\n{}\n{}", LOCAL_SECTION, local.body, REMOTE_SECTION, remote.body)
    };

    NoteRecord {
        id: local.id.clone(),
        title,
        body,
        updated_at: local.updated_at.max(remote.updated_at),
        version: Some(local.effective_version().max(remote.effective_version()).saturating_add(1)),
        origin_node_id: local.origin_node_id.clone(),
        author_node_id: local.author_node_id.clone(),
        merged: true,
    }
}

/// Holds the active policy; swappable at runtime
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Create resolver with an initial policy
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Replace the active policy
    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        debug!(policy = policy.name(), "switching conflict policy");
        self.policy = policy;
    }

    /// Active policy
    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Delegate to the active policy
    pub fn resolve(&self, local: Option<&NoteRecord>, remote: Option<&NoteRecord>) -> Option<NoteRecord> {
        self.policy.resolve(local, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NoteId, Timestamp};

    fn note(body: &str, updated_at: u64, version: Option<u64>, author: &str, origin: &str) -> NoteRecord {
        NoteRecord {
            id: NoteId::from("n1"),
            title: "title".into(),
            body: body.into(),
            updated_at: Timestamp::from_millis(updated_at),
            version,
            origin_node_id: NodeId::from(origin),
            author_node_id: NodeId::from(author),
            merged: false,
        }
    }

    #[test]
    fn test_absent_side_returns_present_side() {
        let a = note("a", 1, None, "node_a", "node_a");
        for kind in [
            ConflictPolicyKind::LastWriteWins,
            ConflictPolicyKind::FirstWriteWins,
            ConflictPolicyKind::VersionBased,
            ConflictPolicyKind::ContentMerge,
            ConflictPolicyKind::AuthorPriority,
        ] {
            let policy = kind.build(&NodeId::from("node_z"));
            assert_eq!(policy.resolve(Some(&a), None), Some(a.clone()));
            assert_eq!(policy.resolve(None, Some(&a)), Some(a.clone()));
            assert_eq!(policy.resolve(None, None), None);
        }
    }

    #[test]
    fn test_last_write_wins_tie_favors_remote() {
        let local = note("local", 100, None, "node_a", "node_a");
        let remote = note("remote", 100, None, "node_b", "node_b");
        let winner = ConflictPolicy::LastWriteWins.resolve_pair(&local, &remote);
        assert_eq!(winner.body, "remote");
    }

    #[test]
    fn test_first_write_wins_keeps_older() {
        let local = note("local", 300, None, "node_a", "node_a");
        let remote = note("remote", 200, None, "node_b", "node_b");
        assert_eq!(ConflictPolicy::FirstWriteWins.resolve_pair(&local, &remote).body, "remote");
        assert_eq!(ConflictPolicy::FirstWriteWins.resolve_pair(&remote, &local).body, "remote");
    }

    #[test]
    fn test_version_based_prefers_version_then_time() {
        let local = note("local", 500, Some(3), "node_a", "node_a");
        let remote = note("remote", 900, Some(2), "node_b", "node_b");
        assert_eq!(ConflictPolicy::VersionBased.resolve_pair(&local, &remote).body, "local");

        let remote = note("remote", 900, Some(3), "node_b", "node_b");
        assert_eq!(ConflictPolicy::VersionBased.resolve_pair(&local, &remote).body, "remote");

        // Missing version reads as 1
        let local = note("local", 500, None, "node_a", "node_a");
        let remote = note("remote", 100, Some(1), "node_b", "node_b");
        assert_eq!(ConflictPolicy::VersionBased.resolve_pair(&local, &remote).body, "local");
    }

    #[test]
    fn test_content_merge_identical_content_returns_later_input() {
        let local = note("same", 100, Some(1), "node_a", "node_a");
        let remote = note("same", 200, Some(1), "node_b", "node_b");
        let winner = ConflictPolicy::ContentMerge.resolve_pair(&local, &remote);
        assert_eq!(winner, remote);
        assert!(!winner.merged);
    }

    #[test]
    fn test_content_merge_synthesizes_record() {
        let mut local = note("draft", 100, Some(2), "node_a", "node_a");
        local.title = "Plan".into();
        let mut remote = note("final", 200, Some(4), "node_b", "node_b");
        remote.title = "Plan v2".into();

        let merged = ConflictPolicy::ContentMerge.resolve_pair(&local, &remote);
        assert_eq!(merged.id, local.id);
        assert_eq!(merged.title, "Plan / Plan v2");
        assert_eq!(
            merged.body,
            "=== LOCAL VERSION ===\ndraft\n\n=== REMOTE VERSION ===\nfinal"
        );
        assert_eq!(merged.updated_at, Timestamp::from_millis(200));
        assert_eq!(merged.version, Some(5));
        assert_eq!(merged.author_node_id, local.author_node_id);
        assert!(merged.merged);
    }

    #[test]
    fn test_content_merge_saturates_version() {
        let local = note("draft", 100, Some(1), "node_a", "node_a");
        let remote = note("final", 200, Some(u64::MAX), "node_b", "node_b");

        let merged = ConflictPolicy::ContentMerge.resolve_pair(&local, &remote);
        assert_eq!(merged.version, Some(u64::MAX));
        assert!(merged.merged);
        assert!(merged.body.contains("final"));
    }

    #[test]
    fn test_author_priority_branches() {
        let policy = ConflictPolicy::AuthorPriority { self_id: NodeId::from("node_a") };

        // Local authored by self wins even when older
        let local = note("mine", 1, None, "node_a", "node_a");
        let remote = note("theirs", 999, None, "node_b", "node_b");
        assert_eq!(policy.resolve_pair(&local, &remote).body, "mine");

        // Self-consistent remote wins over newer foreign local
        let local = note("foreign", 999, None, "node_c", "node_b");
        let remote = note("theirs", 1, None, "node_b", "node_b");
        assert_eq!(policy.resolve_pair(&local, &remote).body, "theirs");

        // Otherwise last-write-wins
        let local = note("foreign", 999, None, "node_c", "node_b");
        let remote = note("edited", 1, None, "node_d", "node_b");
        assert_eq!(policy.resolve_pair(&local, &remote).body, "foreign");
    }

    #[test]
    fn test_policy_kind_round_trips_names() {
        for name in ["last-write-wins", "first-write-wins", "version-based", "content-merge", "author-priority"] {
            let kind: ConflictPolicyKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("newest".parse::<ConflictPolicyKind>().is_err());
    }

    #[test]
    fn test_resolver_swaps_policy() {
        let mut resolver = ConflictResolver::default();
        assert_eq!(resolver.policy().kind(), ConflictPolicyKind::LastWriteWins);
        resolver.set_policy(ConflictPolicy::FirstWriteWins);

        let local = note("old", 1, None, "node_a", "node_a");
        let remote = note("new", 2, None, "node_b", "node_b");
        assert_eq!(resolver.resolve(Some(&local), Some(&remote)).unwrap().body, "old");
    }
}
