//! Network module for relay-negotiated peer links
//!
//! Handles relay polling, offer/answer/candidate exchange, the peer transport
//! capability, and the session lifecycle.

mod connection;
mod error;
mod ice;
pub mod mock;
mod poller;
mod relay;
mod rtc;
mod session;
mod signaling;
mod transport;

pub use connection::{ConnectionState, StateCell};
pub use error::NetworkError;
pub use ice::{default_ice_servers, IceServer, DEFAULT_STUN_SERVERS};
pub use poller::{start_polling, Clock, PollConfig, PollHandle, TokioClock};
pub use relay::{HttpRelay, Relay, RelayConfig, RelayResponse, DEFAULT_RELAY_URL};
pub use rtc::{WebRtcEndpoint, WebRtcTransport};
pub use session::{MessageCallback, ReadySignal, Session, SessionConfig, DEFAULT_EVENT_BUFFER};
pub use signaling::{ClientId, ExchangeProgress, HandshakeMessage, Role, SignalingExchange};
pub use transport::{
    DataChannel, EventSender, IceCandidate, PeerEndpoint, PeerTransport, SdpKind,
    SessionDescription, TransportEvent, DATA_CHANNEL_LABEL,
};
