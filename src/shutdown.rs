//! Signal-driven shutdown.
//!
//! A single `watch::channel(false)` is the shutdown broadcast: every task that
//! must stop (the proxy accept loop) holds a receiver, and the coordinator
//! flips it to `true` exactly once.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Phase of the supervisor's shutdown state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Terminated,
}

/// Termination signals the supervisor reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Owns the shutdown broadcast and the `Running → Draining → Terminated` phase
pub struct ShutdownCoordinator {
    phase: Mutex<ShutdownPhase>,
    tx: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            phase: Mutex::new(ShutdownPhase::Running),
            tx,
        }
    }

    /// Receiver that flips to `true` when draining begins
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    /// Enter `Draining` and tell every subscriber to stop accepting work.
    ///
    /// Returns `false` if shutdown was already under way.
    pub fn begin_drain(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase != ShutdownPhase::Running {
            info!(phase = ?*phase, "Shutdown already in progress");
            return false;
        }
        *phase = ShutdownPhase::Draining;
        self.tx.send_replace(true);
        info!("Draining: no longer accepting connections");
        true
    }

    /// Enter `Terminated`; called once children have been signalled
    pub fn finish(&self) {
        let mut phase = self.phase.lock();
        if *phase == ShutdownPhase::Running {
            // Terminating without draining still has to stop the listener
            self.tx.send_replace(true);
        }
        *phase = ShutdownPhase::Terminated;
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
pub async fn wait_for_signal() -> anyhow::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok(ShutdownSignal::Terminate),
        _ = sigint.recv() => Ok(ShutdownSignal::Interrupt),
    }
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> anyhow::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}
