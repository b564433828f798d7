//! Peer session lifecycle
//!
//! A [`Session`] owns one connection attempt at a time. `host()` and `join()`
//! validate the current state synchronously, then hand negotiation to a
//! driver task. The driver is the only consumer of transport events and
//! inbound relay messages, so every negotiation step and state change happens
//! in one place, one event at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionState, StateCell};
use super::error::NetworkError;
use super::ice::{default_ice_servers, IceServer};
use super::poller::{start_polling, Clock, PollConfig, PollHandle, TokioClock};
use super::relay::Relay;
use super::signaling::{ClientId, Role, SignalingExchange};
use super::transport::{DataChannel, PeerEndpoint, PeerTransport, TransportEvent};
use crate::protocol::payload;

/// Default capacity of the transport event queue
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Callback for payloads received on the data channel
pub type MessageCallback = Box<dyn Fn(Value) + Send + Sync + 'static>;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// STUN/TURN servers handed to the transport
    pub ice_servers: Vec<IceServer>,
    /// Relay polling schedule
    #[serde(skip)]
    pub poll: PollConfig,
    /// Ask the transport for in-order delivery on the data channel
    pub ordered: bool,
    /// Stop polling the relay once the channel is open
    pub stop_polling_on_open: bool,
    /// Transport events held for the driver before the endpoint has to wait.
    /// Bounds how many inbound frames queue behind a slow `on_message`.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            poll: PollConfig::default(),
            ordered: true,
            stop_polling_on_open: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Resolves once the data channel of the current attempt is open
#[derive(Debug)]
pub struct ReadySignal {
    rx: oneshot::Receiver<Result<(), NetworkError>>,
}

impl ReadySignal {
    /// Wait for the channel to open.
    ///
    /// Fails with the negotiation error if the attempt was torn down first.
    pub async fn wait(self) -> Result<(), NetworkError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::NegotiationAborted),
        }
    }
}

/// Resources of one connection attempt, shared between the session handle
/// and its driver
struct Link {
    endpoint: Mutex<Option<Arc<dyn PeerEndpoint>>>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    poll: Mutex<Option<PollHandle>>,
    ready_tx: Mutex<Option<oneshot::Sender<Result<(), NetworkError>>>>,
}

impl Link {
    fn new(ready_tx: oneshot::Sender<Result<(), NetworkError>>) -> Self {
        Self {
            endpoint: Mutex::new(None),
            channel: Mutex::new(None),
            poll: Mutex::new(None),
            ready_tx: Mutex::new(Some(ready_tx)),
        }
    }

    fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().clone()
    }

    fn stop_polling(&self) {
        if let Some(poll) = self.poll.lock().take() {
            poll.cancel();
        }
    }

    /// Resolve the ready signal; later calls are no-ops
    fn resolve(&self, result: Result<(), NetworkError>) {
        if let Some(tx) = self.ready_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    /// Stop polling, close the channel and endpoint and drop both references.
    ///
    /// A slot is only cleared once its `close()` has returned, so a shutdown
    /// cancelled halfway leaves the rest for the next one.
    async fn shutdown(&self) {
        self.stop_polling();

        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close data channel: {}", e);
            }
            self.channel.lock().take();
        }

        let endpoint = self.endpoint.lock().clone();
        if let Some(endpoint) = endpoint {
            if let Err(e) = endpoint.close().await {
                warn!("Failed to close peer endpoint: {}", e);
            }
            self.endpoint.lock().take();
        }
    }
}

/// A peer-to-peer link negotiated over a relay
pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn PeerTransport>,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    state: StateCell,
    client_id: Option<ClientId>,
    link: Option<Arc<Link>>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a new session
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn PeerTransport>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self::with_clock(config, transport, relay, Arc::new(TokioClock))
    }

    /// Create a new session whose relay polling sleeps on `clock`
    pub fn with_clock(
        config: SessionConfig,
        transport: Arc<dyn PeerTransport>,
        relay: Arc<dyn Relay>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            transport,
            relay,
            clock,
            state: StateCell::default(),
            client_id: None,
            link: None,
            driver: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get().is_open()
    }

    /// Client ID of the current or most recent attempt
    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Host a new connection: create the channel, send an offer, wait for an answer
    pub fn host<F>(
        &mut self,
        client_id: impl Into<ClientId>,
        on_message: F,
    ) -> Result<ReadySignal, NetworkError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.start(Role::Host, client_id.into(), Box::new(on_message))
    }

    /// Join an existing host: wait for its offer and answer it
    pub fn join<F>(
        &mut self,
        client_id: impl Into<ClientId>,
        on_message: F,
    ) -> Result<ReadySignal, NetworkError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.start(Role::Join, client_id.into(), Box::new(on_message))
    }

    fn start(
        &mut self,
        role: Role,
        client_id: ClientId,
        on_message: MessageCallback,
    ) -> Result<ReadySignal, NetworkError> {
        let misuse = |state: ConnectionState| match state {
            ConnectionState::Open => NetworkError::AlreadyOpen,
            _ => NetworkError::AlreadyInitializing,
        };
        let current = self.state.get();
        if !current.can_start() {
            return Err(misuse(current));
        }
        self.state
            .transition(current, ConnectionState::Initializing)
            .map_err(misuse)?;

        // A previous attempt that closed on its own may still hold a finished driver
        if let Some(old) = self.driver.take() {
            old.abort();
        }

        info!("[{}] Starting {:?} negotiation", client_id, role);

        let (ready_tx, ready_rx) = oneshot::channel();
        let link = Arc::new(Link::new(ready_tx));
        let driver = Driver {
            role,
            client_id: client_id.clone(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            relay: self.relay.clone(),
            clock: self.clock.clone(),
            state: self.state.clone(),
            link: link.clone(),
            on_message,
        };

        self.client_id = Some(client_id);
        self.link = Some(link);
        self.driver = Some(tokio::spawn(driver.run()));

        Ok(ReadySignal { rx: ready_rx })
    }

    /// Send a payload to the remote peer
    pub async fn send<T>(&self, payload: &T) -> Result<(), NetworkError>
    where
        T: Serialize + ?Sized,
    {
        if !self.state.get().is_open() {
            return Err(NetworkError::ChannelNotOpen);
        }
        let channel = self
            .link
            .as_ref()
            .and_then(|link| link.channel())
            .ok_or(NetworkError::ChannelNotOpen)?;

        let frame = payload::encode(payload)?;
        debug!("Sending {} byte frame on '{}'", frame.len(), channel.label());
        channel.send_text(frame).await
    }

    /// Close the channel and the endpoint.
    ///
    /// The session ends up `Closed` and can host or join again.
    pub async fn disconnect(&mut self) -> Result<(), NetworkError> {
        if !self.state.get().is_open() {
            return Err(NetworkError::NotOpenCannotDisconnect);
        }
        info!("Disconnecting");

        // The driver may be mid-shutdown; wait until it has really stopped
        if let Some(driver) = self.driver.take() {
            driver.abort();
            let _ = driver.await;
        }
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(link) = self.link.take() {
            link.stop_polling();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { link.shutdown().await });
            }
        }
    }
}

/// Background task running one negotiation leg and the open channel
struct Driver {
    role: Role,
    client_id: ClientId,
    config: SessionConfig,
    transport: Arc<dyn PeerTransport>,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    state: StateCell,
    link: Arc<Link>,
    on_message: MessageCallback,
}

impl Driver {
    async fn run(self) {
        let (event_tx, mut events) = mpsc::channel(self.config.event_buffer.max(1));
        let endpoint = match self
            .transport
            .create_endpoint(&self.config.ice_servers, event_tx)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => return self.fail(e).await,
        };
        *self.link.endpoint.lock() = Some(endpoint.clone());

        let mut exchange = SignalingExchange::new(
            self.role,
            self.client_id.clone(),
            endpoint,
            self.relay.clone(),
        );

        if self.role == Role::Host {
            match exchange.open_as_host(self.config.ordered).await {
                Ok(channel) => *self.link.channel.lock() = Some(channel),
                Err(e) => return self.fail(e).await,
            }
        }

        // At most one relay message per poll cycle
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        let poll = start_polling(
            self.relay.clone(),
            self.clock.clone(),
            self.client_id.clone(),
            self.config.poll.clone(),
            move |message| {
                let _ = inbound_tx.send(message);
            },
        );
        *self.link.poll.lock() = Some(poll);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("[{}] Transport event stream ended", self.client_id);
                        break;
                    };
                    if !self.handle_event(event, &exchange).await {
                        break;
                    }
                }
                Some(message) = inbound.recv() => {
                    if let Err(e) = exchange.handle_inbound(message).await {
                        if self.state.get().is_open() {
                            error!("[{}] Late negotiation error: {}", self.client_id, e);
                        } else {
                            return self.fail(e).await;
                        }
                    }
                }
            }
        }
    }

    /// Returns false once the link is finished
    async fn handle_event(&self, event: TransportEvent, exchange: &SignalingExchange) -> bool {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                exchange.forward_candidate(candidate).await;
            }
            TransportEvent::DataChannel(channel) => {
                if self.role == Role::Host {
                    warn!(
                        "[{}] Ignoring unexpected inbound channel '{}'",
                        self.client_id,
                        channel.label()
                    );
                } else {
                    info!("[{}] Received data channel '{}'", self.client_id, channel.label());
                    *self.link.channel.lock() = Some(channel);
                }
            }
            TransportEvent::ChannelOpen => {
                if self.link.channel().is_none() {
                    warn!("[{}] Channel open reported before any channel exists", self.client_id);
                    return true;
                }
                match self
                    .state
                    .transition(ConnectionState::Initializing, ConnectionState::Open)
                {
                    Ok(()) => {
                        info!("[{}] Data channel open", self.client_id);
                        self.link.resolve(Ok(()));
                        if self.config.stop_polling_on_open {
                            self.link.stop_polling();
                        }
                    }
                    Err(state) => debug!("[{}] Channel open while {:?}", self.client_id, state),
                }
            }
            TransportEvent::ChannelClosed => match self.state.get() {
                ConnectionState::Open => {
                    info!("[{}] Data channel closed", self.client_id);
                    self.link.shutdown().await;
                    self.state.set(ConnectionState::Closed);
                    return false;
                }
                ConnectionState::Initializing => {
                    self.fail(NetworkError::NegotiationFailed).await;
                    return false;
                }
                state => debug!("[{}] Channel closed while {:?}", self.client_id, state),
            },
            TransportEvent::ChannelMessage(frame) => match payload::decode(&frame) {
                Ok(value) => (self.on_message)(value),
                Err(e) => warn!("[{}] Dropping inbound frame: {}", self.client_id, e),
            },
        }
        true
    }

    /// Tear down a failed attempt and report the error through the ready signal
    async fn fail(&self, e: NetworkError) {
        error!("[{}] Negotiation failed: {}", self.client_id, e);
        self.link.shutdown().await;
        self.state.set(ConnectionState::Closed);
        self.link.resolve(Err(e));
    }
}
