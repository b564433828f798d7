//! Relay polling loop
//!
//! Each cycle sleeps, issues one dequeue request and reacts to the answer.
//! The next cycle is only scheduled once the previous response (or failure)
//! has been observed, so at most one request is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::relay::{Relay, RelayResponse};
use super::signaling::{ClientId, HandshakeMessage};

/// Source of delays for the polling loop
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock delays via tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Polling schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay before the very first request
    pub initial_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
        }
    }
}

/// Cancellation handle for a running poll loop.
///
/// Cloning shares the same flag. Cancelling is idempotent and may happen
/// from inside the message callback.
#[derive(Debug, Clone, Default)]
pub struct PollHandle {
    cancelled: Arc<AtomicBool>,
}

impl PollHandle {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Relay polling cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Start polling the relay for `client_id` on a background task.
///
/// `on_message` is called for every handshake message, in arrival order.
pub fn start_polling<F>(
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    client_id: ClientId,
    config: PollConfig,
    on_message: F,
) -> PollHandle
where
    F: FnMut(HandshakeMessage) + Send + 'static,
{
    let handle = PollHandle::default();
    let task_handle = handle.clone();

    tokio::spawn(async move {
        poll_loop(relay, clock, client_id, config, task_handle, on_message).await;
    });

    handle
}

async fn poll_loop<F>(
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    client_id: ClientId,
    config: PollConfig,
    handle: PollHandle,
    mut on_message: F,
) where
    F: FnMut(HandshakeMessage) + Send,
{
    let mut delay = config.initial_delay;

    loop {
        trace!("Polling relay for {} in {:?}", client_id, delay);
        clock.sleep(delay).await;
        if handle.is_cancelled() {
            break;
        }

        let result = relay.fetch(&client_id).await;
        if handle.is_cancelled() {
            trace!("Discarding relay response after cancel");
            break;
        }

        match result {
            Ok(RelayResponse::Retry(server_delay)) => {
                delay = server_delay;
            }
            Ok(RelayResponse::Message(message)) => {
                debug!("Relay delivered {} for {}", message.kind(), client_id);
                on_message(message);
                delay = Duration::ZERO;
            }
            Ok(RelayResponse::Empty) => {}
            Err(e) => {
                warn!("Relay poll for {} failed: {}", client_id, e);
            }
        }

        if handle.is_cancelled() {
            break;
        }
    }

    debug!("Relay polling for {} stopped", client_id);
}
