use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

#[derive(Debug, Default)]
struct GateState {
    busy: usize,
    stopping: bool,
}

/// Drain-then-stop coordinator.
///
/// Every asynchronously triggered handler calls [`enter`](Self::enter) before
/// touching component state and holds the returned guard until it is done.
/// [`stop`](Self::stop) flips `stopping` under the same lock, so no handler can
/// enter afterwards, and waits until every guard has been dropped.
#[derive(Debug, Default)]
pub struct ShutdownGate {
    state: Mutex<GateState>,
    idle: Notify,
}

impl ShutdownGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `None` once stopping has begun.
    pub fn enter(self: &Arc<Self>) -> Option<GateGuard> {
        let mut state = self.lock();
        if state.stopping {
            return None;
        }
        state.busy += 1;
        Some(GateGuard { gate: self.clone() })
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    pub fn busy(&self) -> usize {
        self.lock().busy
    }

    /// Refuses new entries and waits for in-flight handlers to leave.
    /// Calling it again after the first call returns once the gate is idle.
    pub async fn stop(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                state.stopping = true;
                if state.busy == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.busy -= 1;
        if state.busy == 0 && state.stopping {
            self.idle.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof of being inside a gated section; leaving happens on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<ShutdownGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
