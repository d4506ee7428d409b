//! Shutdown coordination.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::Result;
use crate::types::Event;

use super::Relay;

/// How often shutdown re-checks the active jobs
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Relay {
    /// Gracefully shut down the relay
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops admitting new requests
    /// 2. Stops the queue processor and signals every active job
    /// 3. Waits for active jobs to reach a chunk boundary (up to `shutdown_timeout`)
    /// 4. Flushes and closes every status message
    /// 5. Marks the clean shutdown in the database
    ///
    /// Interrupted jobs go back to `Queued` with their upload session kept, so the next
    /// start resumes them from the committed range. Jobs still waiting in the queue stay
    /// queued in the database.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("initiating graceful shutdown");

        // 1. Stop accepting new requests
        self.queue_state
            .accepting_new
            .store(false, Ordering::SeqCst);

        // 2. Stop dispatching and signal active jobs (job tokens are children)
        self.queue_state.shutdown.cancel();

        // 3. Wait for active jobs with timeout
        let timeout = self.config.persistence.shutdown_timeout;
        match tokio::time::timeout(timeout, self.wait_for_active_jobs()).await {
            Ok(()) => tracing::info!("all active jobs stopped"),
            Err(_) => {
                let remaining = self.queue_state.active_jobs.lock().await.len();
                tracing::warn!(
                    remaining,
                    timeout_secs = timeout.as_secs(),
                    "timeout waiting for active jobs, proceeding with shutdown"
                );
            }
        }

        // 4. Final status edits
        self.pipeline.reporter.close_all().await;

        // 5. Mark clean shutdown in database
        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "failed to mark clean shutdown in database");
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_active_jobs(&self) {
        loop {
            let active_count = self.queue_state.active_jobs.lock().await.len();
            if active_count == 0 {
                return;
            }
            tracing::debug!(active_count, "waiting for active jobs to stop");
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }
}
