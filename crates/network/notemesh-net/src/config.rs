//! Configuration types for a notemesh node.

use crate::dissemination::BroadcastPolicyKind;
use crate::error::{NetworkError, Result};
use notemesh_replica::{ConflictPolicyKind, NodeId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest peer or message priority.
pub const MAX_PRIORITY: u8 = 10;

/// Main configuration for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id; generated on startup when absent
    pub node_id: Option<String>,

    /// Signaling relay WebSocket URL
    pub relay_url: String,

    /// Persistence key for the note snapshot
    pub storage_key: String,

    /// WebRTC transport configuration
    pub webrtc: WebRtcConfig,

    /// Negotiation configuration
    pub negotiation: NegotiationConfig,

    /// Sync protocol configuration
    pub sync: SyncConfig,

    /// Dissemination configuration
    pub dissemination: DisseminationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            relay_url: "ws://127.0.0.1:3000".to_string(),
            storage_key: "notemesh-notes".to_string(),
            webrtc: WebRtcConfig::default(),
            negotiation: NegotiationConfig::default(),
            sync: SyncConfig::default(),
            dissemination: DisseminationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| NetworkError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| NetworkError::Configuration(e.to_string()))
    }

    /// Configured node id, or a freshly generated one
    pub fn resolve_node_id(&self) -> NodeId {
        match &self.node_id {
            Some(id) => NodeId::new(id.clone()),
            None => NodeId::generate(),
        }
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.node_id {
            if id.trim().is_empty() {
                return Err(NetworkError::Configuration("node_id must not be empty".into()));
            }
        }
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(NetworkError::Configuration(format!(
                "relay_url must use ws:// or wss://, got {}",
                self.relay_url
            )));
        }
        if self.storage_key.is_empty() {
            return Err(NetworkError::Configuration("storage_key must not be empty".into()));
        }
        if self.negotiation.max_pending_candidates == 0 {
            return Err(NetworkError::Configuration(
                "negotiation.max_pending_candidates must be at least 1".into(),
            ));
        }
        if self.dissemination.gossip_fanout == 0 {
            return Err(NetworkError::Configuration("dissemination.gossip_fanout must be at least 1".into()));
        }
        if self.dissemination.batch_size == 0 {
            return Err(NetworkError::Configuration("dissemination.batch_size must be at least 1".into()));
        }
        if self.dissemination.default_priority > MAX_PRIORITY {
            return Err(NetworkError::Configuration(format!(
                "dissemination.default_priority must be at most {MAX_PRIORITY}"
            )));
        }
        Ok(())
    }
}

/// WebRTC-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs; may be empty for host-only candidates
    pub stun_servers: Vec<String>,

    /// Label of the data channel created by the offerer
    pub channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            channel_label: "notes".to_string(),
        }
    }
}

/// Negotiation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Delay before re-offering to a failed peer
    pub retry_delay_ms: u64,

    /// Reconnect attempts after a failure
    pub max_retries: u32,

    /// Candidates held for a peer with no session yet
    pub max_pending_candidates: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 2000,
            max_retries: 1,
            max_pending_candidates: 64,
        }
    }
}

impl NegotiationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Sync protocol configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Initial conflict policy
    pub conflict_policy: ConflictPolicyKind,

    /// How long a full sync to a peer suppresses further full syncs
    pub marker_window_ms: u64,

    /// Whether peers may switch our policies
    pub accept_remote_strategy_changes: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicyKind::LastWriteWins,
            marker_window_ms: 2000,
            accept_remote_strategy_changes: true,
        }
    }
}

impl SyncConfig {
    pub fn marker_window(&self) -> Duration {
        Duration::from_millis(self.marker_window_ms)
    }
}

/// Dissemination configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisseminationConfig {
    /// Initial broadcast policy
    pub policy: BroadcastPolicyKind,

    /// Peers picked per gossip round
    pub gossip_fanout: usize,

    /// How long a gossip message id is remembered
    pub gossip_ttl_ms: u64,

    /// Hops after which gossip stops being forwarded
    pub gossip_max_hops: u32,

    /// Queued messages that force a batch flush
    pub batch_size: usize,

    /// Time after the first queued message that forces a flush
    pub batch_delay_ms: u64,

    /// Priority for peers and messages without an explicit one
    pub default_priority: u8,
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            policy: BroadcastPolicyKind::BroadcastAll,
            gossip_fanout: 3,
            gossip_ttl_ms: 60_000,
            gossip_max_hops: 6,
            batch_size: 5,
            batch_delay_ms: 100,
            default_priority: 5,
        }
    }
}

impl DisseminationConfig {
    pub fn gossip_ttl(&self) -> Duration {
        Duration::from_millis(self.gossip_ttl_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}
