//! In-memory relay and peer transport
//!
//! Lets two sessions in one process negotiate without a relay server or a
//! real ICE stack. Endpoints created by the same [`MemoryTransport`] find each
//! other through the descriptions they exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tracing::debug;

use super::error::NetworkError;
use super::ice::IceServer;
use super::relay::{Relay, RelayResponse};
use super::signaling::{ClientId, HandshakeMessage};
use super::transport::{
    DataChannel, EventSender, IceCandidate, PeerEndpoint, PeerTransport, SdpKind,
    SessionDescription, TransportEvent,
};

// ============================================================================
// Memory Relay
// ============================================================================

/// Relay that forwards between paired client ids
pub struct MemoryRelay {
    peers: Mutex<HashMap<ClientId, ClientId>>,
    queues: Mutex<HashMap<ClientId, VecDeque<HandshakeMessage>>>,
    posted: Mutex<Vec<(ClientId, HandshakeMessage)>>,
    fetches: Mutex<HashMap<ClientId, usize>>,
    retry_delay: Duration,
    offline: AtomicBool,
}

impl MemoryRelay {
    /// Create a relay that asks pollers to retry after `retry_delay` when idle
    pub fn new(retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            posted: Mutex::new(Vec::new()),
            fetches: Mutex::new(HashMap::new()),
            retry_delay,
            offline: AtomicBool::new(false),
        })
    }

    /// Route everything posted by `a` to `b` and vice versa
    pub fn pair(&self, a: impl Into<ClientId>, b: impl Into<ClientId>) {
        let (a, b) = (a.into(), b.into());
        let mut peers = self.peers.lock();
        peers.insert(a.clone(), b.clone());
        peers.insert(b, a);
    }

    /// Queue a message for `client_id` as if its peer had posted it
    pub fn inject(&self, client_id: impl Into<ClientId>, message: HandshakeMessage) {
        self.queues
            .lock()
            .entry(client_id.into())
            .or_default()
            .push_back(message);
    }

    /// Everything `client_id` has posted, in order
    pub fn posted_by(&self, client_id: &ClientId) -> Vec<HandshakeMessage> {
        self.posted
            .lock()
            .iter()
            .filter(|(from, _)| from == client_id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Number of dequeue requests `client_id` has made
    pub fn fetch_count(&self, client_id: &ClientId) -> usize {
        self.fetches.lock().get(client_id).copied().unwrap_or(0)
    }

    /// Make every request fail as unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), NetworkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::RelayUnreachable("relay offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn post(
        &self,
        client_id: &ClientId,
        message: &HandshakeMessage,
    ) -> Result<(), NetworkError> {
        self.check_online()?;
        self.posted.lock().push((client_id.clone(), message.clone()));

        let target = self.peers.lock().get(client_id).cloned();
        match target {
            Some(target) => self.inject(target, message.clone()),
            None => debug!("No peer paired with {}, dropping {}", client_id, message.kind()),
        }
        Ok(())
    }

    async fn fetch(&self, client_id: &ClientId) -> Result<RelayResponse, NetworkError> {
        *self.fetches.lock().entry(client_id.clone()).or_default() += 1;
        self.check_online()?;
        let next = self
            .queues
            .lock()
            .get_mut(client_id)
            .and_then(|queue| queue.pop_front());
        Ok(match next {
            Some(message) => RelayResponse::Message(message),
            None => RelayResponse::Retry(self.retry_delay),
        })
    }
}

// ============================================================================
// Memory Transport
// ============================================================================

const OFFER_PREFIX: &str = "memory-offer/";
const ANSWER_PREFIX: &str = "memory-answer/";

#[derive(Default)]
struct MemoryNetwork {
    next_id: AtomicU64,
    endpoints: Mutex<HashMap<u64, Weak<MemoryEndpoint>>>,
}

/// Peer transport whose endpoints connect in-process
#[derive(Clone, Default)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    created: Arc<Mutex<Vec<Arc<MemoryEndpoint>>>>,
    reject_remote_descriptions: bool,
    stall_first_close: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints from this transport refuse every remote description
    pub fn rejecting_descriptions() -> Self {
        Self {
            reject_remote_descriptions: true,
            ..Self::default()
        }
    }

    /// The first `close()` on each endpoint never completes; later calls do
    pub fn stalling_first_close() -> Self {
        Self {
            stall_first_close: true,
            ..Self::default()
        }
    }

    /// Every endpoint created so far, oldest first
    pub fn endpoints(&self) -> Vec<Arc<MemoryEndpoint>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_endpoint(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Arc<dyn PeerEndpoint>, NetworkError> {
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst);
        let endpoint = Arc::new(MemoryEndpoint {
            id,
            network: self.network.clone(),
            events,
            ice_server_count: ice_servers.len(),
            channel: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_attempts: AtomicUsize::new(0),
            close_stall: self.stall_first_close.then(|| Arc::new(Notify::new())),
            reject_remote_descriptions: self.reject_remote_descriptions,
        });
        self.network
            .endpoints
            .lock()
            .insert(id, Arc::downgrade(&endpoint));
        self.created.lock().push(endpoint.clone());
        Ok(endpoint)
    }
}

/// In-process endpoint
pub struct MemoryEndpoint {
    id: u64,
    network: Arc<MemoryNetwork>,
    events: EventSender,
    ice_server_count: usize,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    connected: AtomicBool,
    closed: AtomicBool,
    close_attempts: AtomicUsize,
    /// Never notified; parks the first close
    close_stall: Option<Arc<Notify>>,
    reject_remote_descriptions: bool,
}

impl MemoryEndpoint {
    /// Remote candidates added so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Channel this endpoint created, if any
    pub fn channel(&self) -> Option<Arc<MemoryChannel>> {
        self.channel.lock().clone()
    }

    pub fn ice_server_count(&self) -> usize {
        self.ice_server_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of times `close()` was entered, completed or not
    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote.lock().is_some()
    }

    fn descriptions_complete(&self) -> bool {
        self.local.lock().is_some() && self.remote.lock().is_some()
    }

    fn peer(&self) -> Option<Arc<MemoryEndpoint>> {
        let remote = self.remote.lock().clone()?;
        let id = remote
            .sdp
            .strip_prefix(OFFER_PREFIX)
            .or_else(|| remote.sdp.strip_prefix(ANSWER_PREFIX))?
            .parse::<u64>()
            .ok()?;
        self.network.endpoints.lock().get(&id)?.upgrade()
    }

    /// Open the channel once both sides hold both descriptions
    async fn try_connect(&self) {
        if !self.descriptions_complete() {
            return;
        }
        let Some(peer) = self.peer() else {
            return;
        };
        if !peer.descriptions_complete() || self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        peer.connected.store(true, Ordering::SeqCst);

        let own_channel = self.channel.lock().clone();
        let peer_channel = peer.channel.lock().clone();
        let (creator, creator_channel, receiver) = match (own_channel, peer_channel) {
            (Some(channel), _) => (self.events.clone(), channel, peer.events.clone()),
            (None, Some(channel)) => (peer.events.clone(), channel, self.events.clone()),
            (None, None) => return,
        };

        let received = Arc::new(MemoryChannel::new(creator_channel.label.clone(), receiver.clone()));
        creator_channel.link(&received);
        received.link(&creator_channel);

        let _ = receiver
            .send(TransportEvent::DataChannel(received.clone()))
            .await;
        creator_channel.open.store(true, Ordering::SeqCst);
        received.open.store(true, Ordering::SeqCst);
        let _ = creator.send(TransportEvent::ChannelOpen).await;
        let _ = receiver.send(TransportEvent::ChannelOpen).await;
        debug!("Memory endpoints {} and {} connected", self.id, peer.id);
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate(json!({
            "candidate": format!("candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host", self.id, 50000 + self.id),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        }))
    }
}

#[async_trait]
impl PeerEndpoint for MemoryEndpoint {
    async fn create_data_channel(
        &self,
        label: &str,
        _ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, NetworkError> {
        let channel = Arc::new(MemoryChannel::new(label.to_string(), self.events.clone()));
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, NetworkError> {
        Ok(SessionDescription::offer(format!("{}{}", OFFER_PREFIX, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NetworkError> {
        if !self.has_remote_description() {
            return Err(NetworkError::Negotiation(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NetworkError> {
        *self.local.lock() = Some(desc);
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(self.local_candidate()))
            .await;
        self.try_connect().await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NetworkError> {
        if self.reject_remote_descriptions {
            return Err(NetworkError::Negotiation(format!(
                "remote {:?} rejected",
                desc.kind
            )));
        }
        let expected = match desc.kind {
            SdpKind::Offer => OFFER_PREFIX,
            SdpKind::Answer => ANSWER_PREFIX,
        };
        if !desc.sdp.starts_with(expected) {
            return Err(NetworkError::Negotiation(format!(
                "unparseable description '{}'",
                desc.sdp
            )));
        }
        *self.remote.lock() = Some(desc);
        self.try_connect().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NetworkError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), NetworkError> {
        let attempt = self.close_attempts.fetch_add(1, Ordering::SeqCst);
        if let (0, Some(stall)) = (attempt, &self.close_stall) {
            stall.notified().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await?;
        }
        Ok(())
    }
}

/// In-process data channel; frames go straight to the linked peer's events
pub struct MemoryChannel {
    label: String,
    events: EventSender,
    remote: Mutex<Weak<MemoryChannel>>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn new(label: String, events: EventSender) -> Self {
        Self {
            label,
            events,
            remote: Mutex::new(Weak::new()),
            open: AtomicBool::new(false),
        }
    }

    fn link(&self, remote: &Arc<MemoryChannel>) {
        *self.remote.lock() = Arc::downgrade(remote);
    }

    async fn mark_closed(&self) -> bool {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::ChannelClosed).await;
            true
        } else {
            false
        }
    }

    /// Push a raw frame to the remote side, bypassing payload encoding
    pub async fn send_raw(&self, frame: &str) -> Result<(), NetworkError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(NetworkError::Transport("channel not open".to_string()));
        }
        let remote = self
            .remote
            .lock()
            .upgrade()
            .ok_or_else(|| NetworkError::Transport("remote channel gone".to_string()))?;
        let _ = remote
            .events
            .send(TransportEvent::ChannelMessage(frame.to_string()))
            .await;
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: String) -> Result<(), NetworkError> {
        self.send_raw(&text).await
    }

    async fn close(&self) -> Result<(), NetworkError> {
        if self.mark_closed().await {
            let remote = self.remote.lock().upgrade();
            if let Some(remote) = remote {
                remote.mark_closed().await;
            }
        }
        Ok(())
    }
}
