//! One-shot startup handshake between the forwarding stage and the HTTP frontend.
//!
//! The forwarding stage owns the [`ReadySignal`] and consumes it once it is able to drain
//! the incoming queue. The frontend holds the [`ReadyWaiter`] and must not start accepting
//! writes before [`ReadyWaiter::wait`] has returned `Ok`.
use std::time::Duration;

use observability_deps::tracing::debug;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("forwarding stage exited before signalling readiness")]
    Abandoned,

    #[error("forwarding stage was not ready after {0:?}")]
    TimedOut(Duration),
}

/// Create the two halves of the handshake
pub fn readiness_handshake() -> (ReadySignal, ReadyWaiter) {
    let (tx, rx) = oneshot::channel();
    (ReadySignal { tx }, ReadyWaiter { rx })
}

#[derive(Debug)]
pub struct ReadySignal {
    tx: oneshot::Sender<()>,
}

impl ReadySignal {
    /// Report readiness, can only happen once
    pub fn notify(self) {
        if self.tx.send(()).is_err() {
            debug!("readiness waiter dropped before notification");
        }
    }
}

#[derive(Debug)]
pub struct ReadyWaiter {
    rx: oneshot::Receiver<()>,
}

impl ReadyWaiter {
    /// Block until the forwarding stage is ready, at most `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<(), ReadinessError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ReadinessError::Abandoned),
            Err(_) => Err(ReadinessError::TimedOut(timeout)),
        }
    }
}
