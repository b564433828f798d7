//! WebRTC peer transport
//!
//! Wraps the `webrtc` crate. Every callback the engine fires is turned into a
//! [`TransportEvent`] on the endpoint's event channel; the session never sees
//! the engine's callback API.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::error::NetworkError;
use super::ice::IceServer;
use super::transport::{
    DataChannel, EventSender, IceCandidate, PeerEndpoint, PeerTransport, SdpKind,
    SessionDescription, TransportEvent,
};

fn negotiation_err(e: webrtc::Error) -> NetworkError {
    NetworkError::Negotiation(e.to_string())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: vec![server.url.clone()],
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Peer transport backed by the `webrtc` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_endpoint(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Arc<dyn PeerEndpoint>, NetworkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NetworkError::Transport(e.to_string()))?,
        );
        debug!("Peer connection created with {} ICE servers", ice_servers.len());

        let endpoint = WebRtcEndpoint {
            pc,
            events,
            pending_candidates: Mutex::new(Some(Vec::new())),
        };
        endpoint.setup_handlers();
        Ok(Arc::new(endpoint))
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    events: EventSender,
    /// Remote candidates held back until a remote description exists.
    /// `None` once it has been applied.
    pending_candidates: Mutex<Option<Vec<RTCIceCandidateInit>>>,
}

impl WebRtcEndpoint {
    fn setup_handlers(&self) {
        // Local candidate discovery - work MUST be inside the returned future
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_value(&init) {
                            Ok(value) => {
                                trace!("Local ICE candidate: {}", init.candidate);
                                let _ = events
                                    .send(TransportEvent::LocalCandidate(IceCandidate(value)))
                                    .await;
                            }
                            Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                        },
                        Err(e) => warn!("Failed to read ICE candidate: {}", e),
                    }
                })
            }));

        // Inbound data channel (joining side)
        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    info!("Received data channel '{}'", dc.label());
                    let channel = Arc::new(WebRtcChannel { dc: dc.clone() });
                    let _ = events.send(TransportEvent::DataChannel(channel)).await;
                    wire_channel(&dc, events);
                })
            }));
    }

    async fn apply_pending_candidates(&self) {
        let pending = self.pending_candidates.lock().await.take();
        for init in pending.unwrap_or_default() {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }
    }
}

/// Forward a channel's open/close/message callbacks as transport events
fn wire_channel(dc: &Arc<RTCDataChannel>, events: EventSender) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let label = open_label.clone();
        Box::pin(async move {
            info!("Data channel '{}' open", label);
            let _ = events.send(TransportEvent::ChannelOpen).await;
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let label = label.clone();
        Box::pin(async move {
            info!("Data channel '{}' closed", label);
            let _ = events.send(TransportEvent::ChannelClosed).await;
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(TransportEvent::ChannelMessage(text)).await;
                }
                Err(e) => warn!("Dropping non-UTF-8 channel message: {}", e),
            }
        })
    }));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NetworkError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation_err)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NetworkError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(NetworkError::Negotiation(format!(
            "unsupported description type {}",
            other
        ))),
    }
}

#[async_trait]
impl PeerEndpoint for WebRtcEndpoint {
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, NetworkError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(negotiation_err)?;
        wire_channel(&dc, self.events.clone());
        Ok(Arc::new(WebRtcChannel { dc }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, NetworkError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NetworkError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NetworkError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NetworkError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation_err)?;
        self.apply_pending_candidates().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NetworkError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)
            .map_err(|e| NetworkError::Negotiation(format!("invalid ICE candidate: {}", e)))?;

        {
            let mut pending = self.pending_candidates.lock().await;
            if let Some(buffer) = pending.as_mut() {
                trace!("Buffering ICE candidate until remote description is set");
                buffer.push(init);
                return Ok(());
            }
        }

        self.pc.add_ice_candidate(init).await.map_err(negotiation_err)
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.pc
            .close()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))
    }
}

/// Wrapper around RTCDataChannel that implements our DataChannel trait
struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send_text(&self, text: String) -> Result<(), NetworkError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::Transport(e.to_string()))
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.dc
            .close()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))
    }
}
