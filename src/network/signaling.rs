//! Offer/answer/candidate exchange over the relay
//!
//! Handles both legs of negotiation. The host creates the data channel and
//! the offer; the joiner waits for the offer and answers it. ICE candidates
//! flow in both directions at any time and are never sequenced against the
//! descriptions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::NetworkError;
use super::relay::Relay;
use super::transport::{
    DataChannel, IceCandidate, PeerEndpoint, SdpKind, SessionDescription, DATA_CHANNEL_LABEL,
};

/// Caller-chosen identity used as the relay routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Handshake message exchanged through the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    /// Any `type` this side does not understand
    #[serde(other)]
    Unrecognized,
}

impl HandshakeMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl From<SessionDescription> for HandshakeMessage {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => Self::Offer { sdp: desc.sdp },
            SdpKind::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}

impl From<IceCandidate> for HandshakeMessage {
    fn from(candidate: IceCandidate) -> Self {
        Self::IceCandidate { candidate }
    }
}

/// Which leg of negotiation this side runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the data channel and sends the offer
    Host,
    /// Waits for an offer and answers it
    Join,
}

/// Progress of the description exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeProgress {
    /// Nothing sent or received yet
    #[default]
    Idle,
    /// Host: offer posted, waiting for the answer
    OfferSent,
    /// Both descriptions applied on this side
    DescriptionsExchanged,
}

/// Negotiation driver for one connection attempt
pub struct SignalingExchange {
    role: Role,
    client_id: ClientId,
    endpoint: Arc<dyn PeerEndpoint>,
    relay: Arc<dyn Relay>,
    progress: ExchangeProgress,
    candidates_added: usize,
}

impl SignalingExchange {
    pub fn new(
        role: Role,
        client_id: ClientId,
        endpoint: Arc<dyn PeerEndpoint>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self {
            role,
            client_id,
            endpoint,
            relay,
            progress: ExchangeProgress::Idle,
            candidates_added: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn progress(&self) -> ExchangeProgress {
        self.progress
    }

    /// Number of remote candidates handed to the endpoint so far
    pub fn candidates_added(&self) -> usize {
        self.candidates_added
    }

    /// Host leg opening: create the channel, then create, apply and post the offer.
    ///
    /// Returns the channel so the caller can hold it before it opens.
    pub async fn open_as_host(&mut self, ordered: bool) -> Result<Arc<dyn DataChannel>, NetworkError> {
        let channel = self
            .endpoint
            .create_data_channel(DATA_CHANNEL_LABEL, ordered)
            .await?;
        debug!("[{}] Data channel '{}' created", self.client_id, channel.label());

        let offer = self.endpoint.create_offer().await?;
        self.endpoint.set_local_description(offer.clone()).await?;
        self.post(offer.into()).await;
        self.progress = ExchangeProgress::OfferSent;
        info!("[{}] Offer sent, waiting for answer", self.client_id);

        Ok(channel)
    }

    /// Forward a locally discovered candidate to the remote peer
    pub async fn forward_candidate(&self, candidate: IceCandidate) {
        debug!("[{}] Local ICE candidate discovered", self.client_id);
        self.post(candidate.into()).await;
    }

    /// Apply one inbound relay message.
    ///
    /// Only a rejected description is an error; everything else is logged
    /// and negotiation carries on.
    pub async fn handle_inbound(&mut self, message: HandshakeMessage) -> Result<(), NetworkError> {
        match (message, self.role) {
            (HandshakeMessage::IceCandidate { candidate }, _) => {
                match self.endpoint.add_ice_candidate(candidate).await {
                    Ok(()) => {
                        self.candidates_added += 1;
                        debug!(
                            "[{}] Remote ICE candidate added ({} total)",
                            self.client_id, self.candidates_added
                        );
                    }
                    Err(e) => error!("[{}] Failed to add ICE candidate: {}", self.client_id, e),
                }
                Ok(())
            }
            (HandshakeMessage::Answer { sdp }, Role::Host) => {
                if self.progress == ExchangeProgress::DescriptionsExchanged {
                    warn!("[{}] Duplicate answer ignored", self.client_id);
                    return Ok(());
                }
                self.endpoint
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await?;
                self.progress = ExchangeProgress::DescriptionsExchanged;
                info!("[{}] Answer applied, host is connected", self.client_id);
                Ok(())
            }
            (HandshakeMessage::Offer { sdp }, Role::Join) => {
                if self.progress == ExchangeProgress::DescriptionsExchanged {
                    warn!("[{}] Duplicate offer ignored", self.client_id);
                    return Ok(());
                }
                self.endpoint
                    .set_remote_description(SessionDescription::offer(sdp))
                    .await?;
                let answer = self.endpoint.create_answer().await?;
                self.endpoint.set_local_description(answer.clone()).await?;
                self.post(answer.into()).await;
                self.progress = ExchangeProgress::DescriptionsExchanged;
                info!("[{}] Answer sent, joiner is connected", self.client_id);
                Ok(())
            }
            (HandshakeMessage::Unrecognized, _) => {
                warn!("[{}] Unexpected handshake message type, ignoring", self.client_id);
                Ok(())
            }
            (other, role) => {
                warn!(
                    "[{}] Unexpected {} for {:?} side, ignoring",
                    self.client_id,
                    other.kind(),
                    role
                );
                Ok(())
            }
        }
    }

    async fn post(&self, message: HandshakeMessage) {
        let kind = message.kind();
        if let Err(e) = self.relay.post(&self.client_id, &message).await {
            warn!("[{}] Failed to post {} to relay: {}", self.client_id, kind, e);
        }
    }
}
