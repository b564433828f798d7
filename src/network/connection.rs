//! Connection lifecycle state

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Connection state
///
/// ```text
/// [*] --> NotCalled
/// NotCalled --> Initializing: host() / join()
/// Initializing --> Open: channel open
/// Initializing --> Closed: negotiation failed
/// Open --> Closed: channel closed / disconnect()
/// Closed --> Initializing: host() / join()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Neither host() nor join() has been called yet
    #[default]
    NotCalled = 0,
    /// Negotiation in progress
    Initializing = 1,
    /// Data channel ready to send/receive
    Open = 2,
    /// Data channel closed
    Closed = 3,
}

impl ConnectionState {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotCalled,
            1 => Self::Initializing,
            2 => Self::Open,
            3 => Self::Closed,
            _ => Self::NotCalled,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether host()/join() may start a new attempt from this state
    pub fn can_start(&self) -> bool {
        matches!(self, Self::NotCalled | Self::Closed)
    }
}

/// Shared, atomically updated connection state
#[derive(Debug, Clone, Default)]
pub struct StateCell {
    inner: Arc<AtomicU8>,
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        let old = ConnectionState::from_u8(self.inner.swap(state as u8, Ordering::SeqCst));
        if old != state {
            debug!("Connection state: {:?} -> {:?}", old, state);
        }
    }

    /// Move `from` -> `to` only if the current state is `from`.
    ///
    /// Returns the state observed before the attempt.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| debug!("Connection state: {:?} -> {:?}", from, to))
            .map_err(ConnectionState::from_u8)
    }
}
