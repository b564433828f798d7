//! relaylink - peer-to-peer data channels negotiated over a polling HTTP relay
//!
//! Two clients that cannot reach each other directly exchange offer, answer
//! and ICE candidates through a small store-and-forward relay, then talk over
//! a direct data channel.

pub mod network;
pub mod protocol;

pub use network::{ConnectionState, NetworkError, Session, SessionConfig};
