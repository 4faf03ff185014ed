//! Manage router shutdown
//!
//! Shutdown of the router is driven by the load balancer in front of it. When the process is
//! asked to stop, e.g., by `SIGTERM` during a deploy, it must first fail its health checks for
//! long enough that the load balancer notices and stops sending it traffic, and only then exit.
//!
//! # Report health with the [`HealthLatch`] type
//!
//! The [`HealthLatch`] is shared between the `/health` handler and the [`ShutdownOrchestrator`].
//! It starts out [`HealthState::Serving`] and can be [`flip`][HealthLatch::flip]ped exactly once
//! to [`HealthState::Draining`]. There is no way back.
//!
//! # Sequence shutdown with the [`ShutdownOrchestrator`] type
//!
//! The [`ShutdownOrchestrator`] waits for a signal future, e.g., [`wait_for_signal`], flips the
//! latch, sleeps for the configured grace period and then cancels the frontend
//! [`CancellationToken`] so the listener stops.
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use observability_deps::tracing::info;
use tokio_util::sync::CancellationToken;

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT");
    Ok(())
}

/// What the `/health` endpoint reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Accepting traffic, health checks pass
    Serving,
    /// About to exit, health checks fail
    Draining,
}

/// One-way switch from [`HealthState::Serving`] to [`HealthState::Draining`]
///
/// Clones share the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct HealthLatch {
    draining: Arc<AtomicBool>,
}

impl HealthLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start draining
    ///
    /// Returns `true` for the call that performed the transition, `false` if the latch was
    /// already draining.
    pub fn flip(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> HealthState {
        if self.is_draining() {
            HealthState::Draining
        } else {
            HealthState::Serving
        }
    }
}

/// Drives the `Serving -> Draining -> exit` sequence
#[derive(Debug)]
pub struct ShutdownOrchestrator {
    latch: HealthLatch,
    grace_period: Duration,
    frontend_shutdown: CancellationToken,
}

impl ShutdownOrchestrator {
    /// Create a [`ShutdownOrchestrator`]
    ///
    /// `frontend_shutdown` is cancelled once the grace period after the shutdown signal has
    /// elapsed.
    pub fn new(
        latch: HealthLatch,
        grace_period: Duration,
        frontend_shutdown: CancellationToken,
    ) -> Self {
        Self {
            latch,
            grace_period,
            frontend_shutdown,
        }
    }

    /// Wait for `signal`, then fail health checks for the grace period before signalling the
    /// frontend to stop
    ///
    /// The returned future completes when the process should exit.
    pub async fn run<F>(self, signal: F)
    where
        F: Future<Output = ()> + Send,
    {
        signal.await;

        // Fail lb health checks.
        self.latch.flip();
        info!(
            grace_period_secs = self.grace_period.as_secs(),
            "Draining, waiting {} secs before shutdown",
            self.grace_period.as_secs()
        );

        tokio::time::sleep(self.grace_period).await;

        info!("Shutting down");
        self.frontend_shutdown.cancel();
    }
}
