//! Data-channel wire protocol.
//!
//! Every frame is a JSON object discriminated by `type`. Outbound events carry
//! an envelope id (`msg_<millis>_<9 chars>`), and gossip copies additionally
//! carry `gossip: true` and a `hopCount`. Peers running without envelopes are
//! still understood since every envelope field is optional on the wire.

use crate::error::{NetworkError, Result};
use notemesh_replica::{random_base36, ConflictPolicyKind, NodeId, NoteId, NoteRecord, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Strategy families a peer can ask us to switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    Conflict,
    Broadcast,
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyType::Conflict => f.write_str("conflict"),
            StrategyType::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Policies a node announces to its peers.
///
/// Names are kept as plain strings so a peer running a policy we do not
/// know is still understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub conflict: String,
    pub broadcast: String,
}

impl StrategyConfig {
    pub fn new(conflict: ConflictPolicyKind, broadcast: impl fmt::Display) -> Self {
        Self {
            conflict: conflict.to_string(),
            broadcast: broadcast.to_string(),
        }
    }
}

/// Peer-to-peer message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Full local state
    SyncAll {
        notes: Vec<NoteRecord>,
        from: NodeId,
        timestamp: Timestamp,
        #[serde(rename = "isResponse", default)]
        is_response: bool,
    },
    NoteCreated {
        note: NoteRecord,
    },
    NoteUpdated {
        note: NoteRecord,
    },
    NoteDeleted {
        #[serde(rename = "noteId")]
        note_id: NoteId,
        from: NodeId,
        timestamp: Timestamp,
    },
    StrategyConfig {
        config: StrategyConfig,
        from: NodeId,
    },
    StrategyChangeRequest {
        #[serde(rename = "strategyType")]
        strategy_type: StrategyType,
        #[serde(rename = "strategyName")]
        strategy_name: String,
        from: NodeId,
    },
    /// Several envelopes flushed together
    Batch {
        messages: Vec<Envelope>,
        timestamp: Timestamp,
    },
}

impl WireMessage {
    /// Wire discriminator, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::SyncAll { .. } => "sync-all",
            WireMessage::NoteCreated { .. } => "note-created",
            WireMessage::NoteUpdated { .. } => "note-updated",
            WireMessage::NoteDeleted { .. } => "note-deleted",
            WireMessage::StrategyConfig { .. } => "strategy-config",
            WireMessage::StrategyChangeRequest { .. } => "strategy-change-request",
            WireMessage::Batch { .. } => "batch",
        }
    }
}

/// Generate an envelope id of the form `msg_<millis>_<9 chars>`.
pub fn new_message_id() -> String {
    format!("msg_{}_{}", Timestamp::now().as_millis(), random_base36(9))
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// A message plus its dissemination metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub gossip: bool,
    #[serde(rename = "hopCount", default, skip_serializing_if = "is_zero")]
    pub hop_count: u32,
    #[serde(flatten)]
    pub message: WireMessage,
}

impl Envelope {
    /// Wrap a message under a fresh id
    pub fn new(message: WireMessage) -> Self {
        Self {
            id: Some(new_message_id()),
            gossip: false,
            hop_count: 0,
            message,
        }
    }

    /// Wrap a point-to-point message that is never disseminated
    pub fn direct(message: WireMessage) -> Self {
        Self {
            id: None,
            gossip: false,
            hop_count: 0,
            message,
        }
    }

    /// Copy tagged for gossip with the hop counter advanced
    pub fn gossip_hop(&self) -> Self {
        Self {
            id: self.id.clone(),
            gossip: true,
            hop_count: self.hop_count.saturating_add(1),
            message: self.message.clone(),
        }
    }

    /// Serialize to a data-channel frame
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| NetworkError::Protocol(format!("failed to encode {}: {e}", self.message.kind())))
    }

    /// Parse a data-channel frame received from `peer`
    pub fn decode(peer: &NodeId, frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| NetworkError::MessageParse {
            peer: peer.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note() -> NoteRecord {
        NoteRecord {
            id: NoteId::from("n1"),
            title: "t".into(),
            body: "b".into(),
            updated_at: Timestamp::from_millis(100),
            version: Some(1),
            origin_node_id: NodeId::from("node_a"),
            author_node_id: NodeId::from("node_a"),
            merged: false,
        }
    }

    #[test]
    fn test_sync_all_wire_shape() {
        let envelope = Envelope::direct(WireMessage::SyncAll {
            notes: vec![note()],
            from: NodeId::from("node_a"),
            timestamp: Timestamp::from_millis(5),
            is_response: false,
        });

        let json: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "sync-all");
        assert_eq!(json["isResponse"], false);
        assert_eq!(json["notes"][0]["updatedAt"], 100);
        assert!(json.get("id").is_none());
        assert!(json.get("hopCount").is_none());
    }

    #[test]
    fn test_gossip_hop_advances_counter() {
        let envelope = Envelope::new(WireMessage::NoteCreated { note: note() });
        let hop = envelope.gossip_hop().gossip_hop();
        assert_eq!(hop.id, envelope.id);
        assert!(hop.gossip);
        assert_eq!(hop.hop_count, 2);

        let json: serde_json::Value = serde_json::from_str(&hop.encode().unwrap()).unwrap();
        assert_eq!(json["gossip"], true);
        assert_eq!(json["hopCount"], 2);
        assert_eq!(json["type"], "note-created");
    }

    #[test]
    fn test_decodes_frames_without_envelope_fields() {
        let peer = NodeId::from("node_b");
        let frame = r#"{"type":"note-deleted","noteId":"n1","from":"node_b","timestamp":7}"#;
        let envelope = Envelope::decode(&peer, frame).unwrap();
        assert_eq!(envelope.id, None);
        assert_eq!(
            envelope.message,
            WireMessage::NoteDeleted {
                note_id: NoteId::from("n1"),
                from: peer.clone(),
                timestamp: Timestamp::from_millis(7),
            }
        );

        let frame = r#"{"type":"strategy-change-request","strategyType":"conflict","strategyName":"content-merge","from":"node_b"}"#;
        let envelope = Envelope::decode(&peer, frame).unwrap();
        assert_eq!(envelope.message.kind(), "strategy-change-request");
    }

    #[test]
    fn test_batch_nests_envelopes() {
        let inner = Envelope::new(WireMessage::NoteUpdated { note: note() });
        let batch = Envelope::direct(WireMessage::Batch {
            messages: vec![inner.clone()],
            timestamp: Timestamp::from_millis(9),
        });

        let decoded = Envelope::decode(&NodeId::from("node_a"), &batch.encode().unwrap()).unwrap();
        let WireMessage::Batch { messages, .. } = decoded.message else {
            panic!("expected batch");
        };
        assert_eq!(messages, vec![inner]);
    }

    #[test]
    fn test_malformed_frames_are_parse_errors() {
        let peer = NodeId::from("node_b");
        for frame in ["not json", r#"{"type":"teleport"}"#, r#"{"type":"note-created"}"#] {
            assert!(matches!(
                Envelope::decode(&peer, frame),
                Err(NetworkError::MessageParse { .. })
            ));
        }
    }

    #[test]
    fn test_message_ids_have_expected_shape() {
        let id = new_message_id();
        let parts: Vec<_> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "msg");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }
}
