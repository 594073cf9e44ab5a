//! Process shutdown coordination.
//!
//! The gateway runs a dozen long-lived tasks (stream, poller, consumers,
//! periodic sweeps); all of them watch one [`CancellationToken`]. This
//! module owns the only place that token is ever cancelled: SIGTERM or
//! SIGINT.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Cancels its token when the process receives a termination signal.
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Register SIGTERM/SIGINT handlers and return the coordinator.
    ///
    /// # Errors
    /// Propagates signal-registration failures, which only happen outside a
    /// Unix environment.
    pub fn install() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(%reason, "shutdown signal received");
            trigger.cancel();
        });
        Ok(Self { token })
    }

    /// A clone of the token for handing to subsystems.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
