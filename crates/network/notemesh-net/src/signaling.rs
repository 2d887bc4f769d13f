//! Signaling relay client and development relay server.
//!
//! The relay is a dumb forwarder: it tracks which node ids are connected,
//! announces arrivals and departures, and forwards `signal` frames by
//! destination id without looking inside them.

use crate::error::{NetworkError, Result, TransportError};
use crate::transport::SignalingLink;
use crate::types::{ClientFrame, EventSender, NodeEvent, RelayEvent, SignalPayload};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use notemesh_replica::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Relay client: registers with the relay and feeds its frames to a node.
pub struct RelayClient {
    /// Relay URL
    server_url: String,

    /// Local node ID
    local_id: NodeId,

    /// Connection to the relay
    connection: Mutex<Option<RelayConnection>>,
}

/// Active relay connection.
struct RelayConnection {
    /// Outgoing frames; sending never waits on the socket
    tx: mpsc::UnboundedSender<ClientFrame>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Creates a new relay client.
    pub fn new(server_url: impl Into<String>, local_id: NodeId) -> Self {
        Self {
            server_url: server_url.into(),
            local_id,
            connection: Mutex::new(None),
        }
    }

    /// Connects, registers and starts forwarding relay frames into `events`.
    pub async fn connect(&self, events: EventSender) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| NetworkError::Transport(TransportError::SignalingFailed(e.to_string())))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();

        let register = serde_json::to_string(&ClientFrame::Register { id: self.local_id.clone() })
            .map_err(|e| NetworkError::Protocol(e.to_string()))?;
        ws_sink
            .send(Message::Text(register))
            .await
            .map_err(|e| NetworkError::Transport(TransportError::SignalingFailed(e.to_string())))?;

        let local_id = self.local_id.clone();
        let task_handle = tokio::spawn(async move {
            // Handle outgoing frames
            let send_task = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize relay frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(json)).await {
                        error!("Failed to send relay frame: {}", e);
                        break;
                    }
                }
            });

            // Handle incoming frames
            while let Some(result) = ws_stream_rx.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayEvent>(&text) {
                        Ok(event) => {
                            if events.send(NodeEvent::Relay(event)).is_err() {
                                debug!(node = %local_id, "node event loop gone, stopping relay reader");
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to parse relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay closed connection");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            send_task.abort();
        });

        if let Some(previous) = self.connection.lock().replace(RelayConnection { tx, task_handle }) {
            previous.task_handle.abort();
        }
        info!(node = %self.local_id, "Connected to relay at {}", self.server_url);
        Ok(())
    }

    /// Disconnects from the relay.
    pub async fn disconnect(&self) {
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            conn.task_handle.abort();
        }
    }

    /// Queues a frame for the writer task.
    fn send_frame(&self, frame: ClientFrame) -> Result<()> {
        let conn = self.connection.lock();
        match conn.as_ref() {
            Some(conn) => conn
                .tx
                .send(frame)
                .map_err(|_| NetworkError::Transport(TransportError::SignalingFailed("relay writer closed".to_string()))),
            None => Err(NetworkError::Transport(TransportError::NotConnected(
                "not connected to relay".to_string(),
            ))),
        }
    }
}

#[async_trait]
impl SignalingLink for RelayClient {
    async fn send_signal(&self, to: &NodeId, signal: SignalPayload) -> Result<()> {
        self.send_frame(ClientFrame::Signal { to: to.clone(), signal })
    }
}

type PeerRegistry = Arc<RwLock<HashMap<NodeId, mpsc::Sender<RelayEvent>>>>;

/// Simple relay server for development and testing.
pub struct RelayServer {
    listener: TcpListener,

    /// Connected nodes
    peers: PeerRegistry,
}

impl RelayServer {
    /// Binds the relay to `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::Transport(TransportError::SignalingFailed(e.to_string())))?;
        Ok(Self {
            listener,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Address the relay is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!("Relay listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| NetworkError::Transport(TransportError::SignalingFailed(e.to_string())))?;

            let peers = self.peers.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_peer_connection(stream, addr, peers).await {
                    error!("Error handling relay connection from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn broadcast(peers: &PeerRegistry, except: &NodeId, event: RelayEvent) {
    let peers = peers.read().await;
    for (id, tx) in peers.iter() {
        if id != except {
            let _ = tx.send(event.clone()).await;
        }
    }
}

/// Handles one node connected to the relay.
async fn handle_peer_connection(stream: TcpStream, addr: SocketAddr, peers: PeerRegistry) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| NetworkError::Transport(TransportError::SignalingFailed(e.to_string())))?;

    let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<RelayEvent>(32);

    let mut node_id: Option<NodeId> = None;

    // Handle outgoing frames
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize relay event: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(json)).await {
                error!("Failed to send relay event: {}", e);
                break;
            }
        }
    });

    // Handle incoming frames
    while let Some(result) = ws_stream_rx.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Register { id }) => {
                    info!("Node {} registered from {}", id, addr);
                    let others: Vec<NodeId> = {
                        let mut registry = peers.write().await;
                        registry.insert(id.clone(), tx.clone());
                        registry.keys().filter(|other| **other != id).cloned().collect()
                    };
                    let _ = tx.send(RelayEvent::PeerList { ids: others }).await;
                    broadcast(&peers, &id, RelayEvent::PeerJoined { id: id.clone() }).await;
                    node_id = Some(id);
                }
                Ok(ClientFrame::Signal { to, signal }) => {
                    let Some(from) = node_id.clone() else {
                        warn!("Signal from unregistered connection {} dropped", addr);
                        continue;
                    };
                    let target = peers.read().await.get(&to).cloned();
                    match target {
                        Some(target) => {
                            let _ = target.send(RelayEvent::Signal { from, signal }).await;
                        }
                        None => warn!("Target node {} not found", to),
                    }
                }
                Err(e) => warn!("Failed to parse frame from {}: {}", addr, e),
            },
            Ok(Message::Close(_)) => {
                info!("Connection from {} closed", addr);
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Clean up
    send_task.abort();
    if let Some(id) = node_id {
        peers.write().await.remove(&id);
        broadcast(&peers, &id, RelayEvent::PeerLeft { id: id.clone() }).await;
        info!("Removed node {} from registry", id);
    }

    Ok(())
}
