//! WebRTC transport implementation for browser compatibility and NAT traversal.

use crate::config::WebRtcConfig;
use crate::error::{NetworkError, Result, TransportError};
use crate::transport::traits::{PeerLink, PeerTransport};
use crate::types::{
    EventSender, IceCandidate, LinkId, LinkState, NodeEvent, SdpType, SessionDescription,
    TransportEvent, TransportEventKind,
};
use async_trait::async_trait;
use notemesh_replica::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// WebRTC transport for browser-compatible P2P connections.
pub struct WebRtcTransport {
    /// ICE servers for NAT traversal
    ice_servers: Vec<RTCIceServer>,

    /// Label of the data channel created by the offerer
    channel_label: String,

    /// WebRTC API instance
    api: Arc<API>,
}

impl WebRtcTransport {
    /// Creates a new WebRTC transport.
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            ice_servers,
            channel_label: config.channel_label.clone(),
            api: Arc::new(api),
        })
    }

    /// Creates a new peer connection.
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        self.api
            .new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| NetworkError::Transport(TransportError::WebRtc(e.to_string())))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open_link(&self, remote: &NodeId, events: EventSender) -> Result<Arc<dyn PeerLink>> {
        let pc = self.create_peer_connection().await?;
        let link = Arc::new(WebRtcLink {
            id: LinkId::next(),
            remote: remote.clone(),
            label: self.channel_label.clone(),
            pc,
            channel: Arc::new(Mutex::new(None)),
            events,
        });
        link.install_handlers();
        info!(peer = %remote, link = %link.id, "created WebRTC peer connection");
        Ok(link)
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}

/// Emits link events into a node's event loop.
#[derive(Clone)]
struct LinkEvents {
    peer: NodeId,
    link: LinkId,
    events: EventSender,
}

impl LinkEvents {
    fn emit(&self, kind: TransportEventKind) {
        let event = NodeEvent::Transport(TransportEvent {
            peer: self.peer.clone(),
            link: self.link,
            kind,
        });
        if self.events.send(event).is_err() {
            debug!(peer = %self.peer, link = %self.link, "node event loop gone, dropping link event");
        }
    }
}

/// Data channel plus the queue feeding its writer task.
struct ChannelWriter {
    channel: Arc<RTCDataChannel>,
    write_tx: mpsc::UnboundedSender<String>,
}

impl ChannelWriter {
    fn new(channel: Arc<RTCDataChannel>, events: LinkEvents) -> Self {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();

        let open_events = events.clone();
        channel.on_open(Box::new(move || {
            open_events.emit(TransportEventKind::ChannelOpen);
            Box::pin(async {})
        }));

        let close_events = events.clone();
        channel.on_close(Box::new(move || {
            close_events.emit(TransportEventKind::ChannelClosed);
            Box::pin(async {})
        }));

        let message_events = events.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => message_events.emit(TransportEventKind::ChannelMessage(text)),
                Err(e) => warn!(peer = %message_events.peer, "dropping non UTF-8 frame: {}", e),
            }
            Box::pin(async {})
        }));

        // Handle outgoing messages
        let writer = channel.clone();
        let peer = events.peer;
        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(e) = writer.send_text(frame).await {
                    error!(%peer, "Failed to send WebRTC data: {}", e);
                }
            }
        });

        Self { channel, write_tx }
    }
}

/// One WebRTC peer connection.
pub struct WebRtcLink {
    id: LinkId,
    remote: NodeId,
    label: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<ChannelWriter>>>,
    events: EventSender,
}

impl WebRtcLink {
    fn link_events(&self) -> LinkEvents {
        LinkEvents {
            peer: self.remote.clone(),
            link: self.id,
            events: self.events.clone(),
        }
    }

    fn install_handlers(&self) {
        let events = self.link_events();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => events.emit(TransportEventKind::LocalCandidate(from_init(init))),
                    Err(e) => warn!(peer = %events.peer, "failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let events = self.link_events();
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer = %events.peer, link = %events.link, "peer connection state: {}", state);
            events.emit(TransportEventKind::StateChanged(link_state(state)));
            Box::pin(async {})
        }));

        // The answering side receives the offerer's channel
        let events = self.link_events();
        let slot = self.channel.clone();
        self.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!(peer = %events.peer, label = channel.label(), "data channel received");
            *slot.lock() = Some(ChannelWriter::new(channel, events.clone()));
            Box::pin(async {})
        }));
    }

    fn negotiation_error(&self, err: impl std::fmt::Display) -> NetworkError {
        NetworkError::negotiation(&self.remote, err)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn id(&self) -> LinkId {
        self.id
    }

    async fn create_data_channel(&self) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(|e| self.negotiation_error(e))?;
        *self.channel.lock() = Some(ChannelWriter::new(channel, self.link_events()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(|e| self.negotiation_error(e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await.map_err(|e| self.negotiation_error(e))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let parsed = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| self.negotiation_error(e))?;

        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    fn is_channel_open(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .is_some_and(|writer| writer.channel.ready_state() == RTCDataChannelState::Open)
    }

    fn send(&self, frame: &str) -> Result<()> {
        let guard = self.channel.lock();
        match guard.as_ref() {
            Some(writer) if writer.channel.ready_state() == RTCDataChannelState::Open => writer
                .write_tx
                .send(frame.to_string())
                .map_err(|_| NetworkError::Transport(TransportError::ChannelClosed(self.remote.to_string()))),
            _ => Err(NetworkError::Transport(TransportError::NotConnected(format!(
                "channel to {} is not open",
                self.remote
            )))),
        }
    }

    async fn close(&self) -> Result<()> {
        let writer = self.channel.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.channel.close().await {
                debug!(peer = %self.remote, "data channel close failed: {}", e);
            }
        }
        self.pc.close().await?;
        debug!(peer = %self.remote, link = %self.id, "closed WebRTC peer connection");
        Ok(())
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}
