//! Background eviction of inactive sessions.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

/// Lower bound on the sweep period, so a zero timeout cannot spin the loop.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Periodically tears down every session that is no longer ready.
///
/// Sleeps for the registry's inactivity timeout between sweeps, or until
/// woken through the shared [`Notify`] (used when the timeout changes).
pub struct LivenessMonitor {
    registry: Arc<SessionRegistry>,
    wake: Arc<Notify>,
}

impl LivenessMonitor {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, wake: Arc<Notify>) -> Self {
        Self { registry, wake }
    }

    /// Signal that starts the next sweep immediately.
    #[must_use]
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Run one sweep. Returns the number of sessions evicted.
    pub async fn sweep(&self) -> usize {
        let mut evicted = 0;
        for session in self.registry.snapshot() {
            if session.is_ready() {
                continue;
            }
            if self
                .registry
                .evict_stale(session.session_id())
                .await
                .is_performed()
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Sweep until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between sweeps, so a teardown in
    /// progress always completes.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Liveness monitor started");

        loop {
            let evicted = self.sweep().await;
            if evicted > 0 {
                tracing::info!(evicted, "Evicted inactive sessions");
            }

            let period = self.registry.inactivity_timeout().max(MIN_SWEEP_INTERVAL);
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.wake.notified() => {
                    tracing::debug!("Liveness monitor woken early");
                }
                () = tokio::time::sleep(period) => {}
            }
        }

        tracing::info!("Liveness monitor stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
