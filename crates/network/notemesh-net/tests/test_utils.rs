//! Common test utilities and helpers.

#![allow(dead_code)]

use notemesh_net::{
    coordinator::{LinkNotice, PeerConnectionCoordinator, PeerEvent},
    event_channel, spawn, EventReceiver, MemoryNetwork, Node, NodeConfig, NodeHandle,
};
use notemesh_replica::{MemorySnapshotStore, NodeId, NoteId, NoteRecord, PersistenceGateway, Timestamp};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::EnvFilter;

/// Initialize test logging
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("notemesh_net=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

/// Node config with a short reconnect delay
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.negotiation.retry_delay_ms = 50;
    config
}

/// Note with fixed fields for convergence scenarios
pub fn note(id: &str, body: &str, updated_at: u64, node: &str) -> NoteRecord {
    NoteRecord {
        id: NoteId::from(id),
        title: "shared".to_string(),
        body: body.to_string(),
        updated_at: Timestamp::from_millis(updated_at),
        version: Some(1),
        origin_node_id: NodeId::from(node),
        author_node_id: NodeId::from(node),
        merged: false,
    }
}

/// Description of one node to start
pub struct NodeSetup {
    pub id: NodeId,
    pub config: NodeConfig,
    pub notes: Vec<NoteRecord>,
}

impl NodeSetup {
    pub fn new(id: &str) -> Self {
        Self {
            id: NodeId::from(id),
            config: test_config(),
            notes: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notes(mut self, notes: Vec<NoteRecord>) -> Self {
        self.notes = notes;
        self
    }
}

/// A running node and its persistence
pub struct TestNode {
    pub id: NodeId,
    pub handle: NodeHandle,
    pub persistence: Arc<MemorySnapshotStore>,
}

/// Joins every node to the relay first, then starts them all.
///
/// Nodes joined together discover each other at once, so every pair starts
/// with both sides offering.
pub fn start_mesh(network: &MemoryNetwork, setups: Vec<NodeSetup>) -> Vec<TestNode> {
    let mut pending: Vec<(Node, EventReceiver, Arc<MemorySnapshotStore>)> = Vec::new();
    for setup in setups {
        let persistence = Arc::new(MemorySnapshotStore::new());
        if !setup.notes.is_empty() {
            persistence.save(&setup.config.storage_key, &setup.notes).unwrap();
        }
        let (events_tx, events_rx) = event_channel();
        let (relay, transport) = network.join(&setup.id, events_tx.clone());
        let node = Node::new(setup.config, setup.id, transport, relay, events_tx, persistence.clone()).unwrap();
        pending.push((node, events_rx, persistence));
    }

    pending
        .into_iter()
        .map(|(node, events, persistence)| {
            let id = node.local_id().clone();
            TestNode {
                id,
                handle: spawn(node, events),
                persistence,
            }
        })
        .collect()
}

/// Polls `check` until it holds, panicking after five seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until `node` has exactly `count` connected peers
pub async fn wait_for_peers(node: &TestNode, count: usize) {
    let handle = &node.handle;
    eventually(&format!("{} to reach {count} peers", node.id), move || async move {
        handle.connected_peers().await.unwrap().len() == count
    })
    .await;
}

/// Waits until `node` has received `count` full states
pub async fn wait_for_full_syncs(node: &TestNode, count: u64) {
    let handle = &node.handle;
    eventually(&format!("{} to receive {count} full syncs", node.id), move || async move {
        handle.stats().await.unwrap().sync.full_syncs_received >= count
    })
    .await;
}

/// A coordinator driven by hand, for poking at a node from outside
pub struct RawPeer {
    pub id: NodeId,
    pub coordinator: PeerConnectionCoordinator,
    events: EventReceiver,
}

impl RawPeer {
    pub fn join(network: &MemoryNetwork, id: &str) -> Self {
        let id = NodeId::from(id);
        let (events_tx, events) = event_channel();
        let (relay, transport) = network.join(&id, events_tx.clone());
        let coordinator =
            PeerConnectionCoordinator::new(id.clone(), transport, relay, events_tx, test_config().negotiation);
        Self { id, coordinator, events }
    }

    /// Processes events until a channel to `peer` opens
    pub async fn connect_to(&mut self, peer: &NodeId) {
        let result = timeout(Duration::from_secs(5), async {
            while let Some(event) = self.events.recv().await {
                for peer_event in PeerEvent::from_node_event(event) {
                    if let Some(LinkNotice::Opened { peer: opened, .. }) = self.coordinator.handle_event(peer_event) {
                        if &opened == peer {
                            return;
                        }
                    }
                }
            }
        })
        .await;
        assert!(result.is_ok(), "{} never connected to {peer}", self.id);
    }

    /// Sends a raw frame on the open channel to `peer`
    pub fn send_raw(&self, peer: &NodeId, frame: &str) {
        let channel = self.coordinator.channel(peer).expect("no open channel");
        channel.send(frame).unwrap();
    }
}
