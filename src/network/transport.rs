//! Peer transport capability
//!
//! The engine that gathers ICE candidates, traverses NATs and carries the
//! data channel is external. The session only sequences calls through these
//! traits and reacts to the events an endpoint emits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::NetworkError;
use super::ice::IceServer;

/// Label used for the single negotiated data channel
pub const DATA_CHANNEL_LABEL: &str = "dataChannel";

/// Which half of the offer/answer exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description produced and consumed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Opaque ICE candidate blob, carried as whatever JSON the transport emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

/// Events an endpoint reports asynchronously
pub enum TransportEvent {
    /// A local candidate was discovered and should reach the remote peer
    LocalCandidate(IceCandidate),
    /// The remote peer opened a channel towards us (joining side)
    DataChannel(Arc<dyn DataChannel>),
    /// The data channel ready-state became "open"
    ChannelOpen,
    /// The data channel ready-state became "closed"
    ChannelClosed,
    /// A text frame arrived on the data channel
    ChannelMessage(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(&m.len()).finish(),
        }
    }
}

/// Sender half endpoints use to report [`TransportEvent`]s.
///
/// The channel is bounded: an endpoint waits for room before reporting more,
/// so a slow consumer holds back inbound frames instead of queueing them.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Factory for local endpoints
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local endpoint configured with the given ICE servers.
    ///
    /// All of the endpoint's events, including those of any data channel it
    /// creates or receives, are delivered on `events`.
    async fn create_endpoint(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Arc<dyn PeerEndpoint>, NetworkError>;
}

/// One side of a peer connection
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, NetworkError>;

    async fn create_offer(&self) -> Result<SessionDescription, NetworkError>;

    async fn create_answer(&self) -> Result<SessionDescription, NetworkError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NetworkError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NetworkError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NetworkError>;

    async fn close(&self) -> Result<(), NetworkError>;
}

/// A bidirectional message channel over a negotiated connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send_text(&self, text: String) -> Result<(), NetworkError>;

    async fn close(&self) -> Result<(), NetworkError>;
}
