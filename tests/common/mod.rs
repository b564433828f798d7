//! Shared test infrastructure for relaylink integration tests
//!
//! Provides:
//! - RecordingClock: logs every requested delay instead of sleeping
//! - ScriptedRelay: answers dequeue requests from a fixed script
//! - wait_until: yield until a condition holds

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use relaylink::network::{Clock, ClientId, HandshakeMessage, NetworkError, Relay, RelayResponse};

/// Retry delay the scripted relay answers with once its script runs out
pub const PARK_DELAY: Duration = Duration::from_secs(60);

/// Entry in the shared poll log
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Sleep(Duration),
    Fetch,
    Delivered(HandshakeMessage),
}

pub type PollLog = Arc<Mutex<Vec<PollEvent>>>;

/// Clock that records delays and only yields to the scheduler.
///
/// Delays of a minute or more never complete, which parks a poller once its
/// script is exhausted.
pub struct RecordingClock {
    log: PollLog,
}

impl RecordingClock {
    pub fn new(log: PollLog) -> Arc<Self> {
        Arc::new(Self { log })
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.log.lock().push(PollEvent::Sleep(duration));
        if duration >= PARK_DELAY {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
    }
}

/// Relay replaying a script of dequeue results, then retrying forever
pub struct ScriptedRelay {
    log: PollLog,
    script: Mutex<VecDeque<Result<RelayResponse, NetworkError>>>,
    /// When set, every fetch waits for a notification before answering
    gate: Option<Arc<Notify>>,
}

impl ScriptedRelay {
    pub fn new(log: PollLog, script: Vec<Result<RelayResponse, NetworkError>>) -> Arc<Self> {
        Arc::new(Self {
            log,
            script: Mutex::new(script.into()),
            gate: None,
        })
    }

    pub fn gated(
        log: PollLog,
        script: Vec<Result<RelayResponse, NetworkError>>,
        gate: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            script: Mutex::new(script.into()),
            gate: Some(gate),
        })
    }
}

#[async_trait]
impl Relay for ScriptedRelay {
    async fn post(&self, _: &ClientId, _: &HandshakeMessage) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn fetch(&self, _: &ClientId) -> Result<RelayResponse, NetworkError> {
        self.log.lock().push(PollEvent::Fetch);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or(Ok(RelayResponse::Retry(PARK_DELAY)))
    }
}

pub fn offer(sdp: &str) -> HandshakeMessage {
    HandshakeMessage::Offer {
        sdp: sdp.to_string(),
    }
}

/// Yield until `cond` holds, failing the test after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {:?}", timeout);
}

/// Await a future with a test timeout
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("timed out")
}
