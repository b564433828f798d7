//! Network error types

use thiserror::Error;

/// Errors that can occur while negotiating or using a peer link
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Still initializing a connection")]
    AlreadyInitializing,

    #[error("A connection is still open, call disconnect() first")]
    AlreadyOpen,

    #[error("Cannot send message until connection is open")]
    ChannelNotOpen,

    #[error("Cannot disconnect from a connection that is not open")]
    NotOpenCannotDisconnect,

    #[error("Relay unreachable: {0}")]
    RelayUnreachable(String),

    #[error("Relay rejected request with HTTP {status}")]
    RelayRejected { status: u16 },

    #[error("Malformed relay payload: {0}")]
    MalformedRelayPayload(String),

    #[error("Malformed channel payload: {0}")]
    MalformedPayload(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Negotiation failed before the channel opened")]
    NegotiationFailed,

    #[error("Connection attempt aborted before the channel opened")]
    NegotiationAborted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    /// Whether the error is caller misuse (state precondition violated)
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitializing
                | Self::AlreadyOpen
                | Self::ChannelNotOpen
                | Self::NotOpenCannotDisconnect
        )
    }
}
