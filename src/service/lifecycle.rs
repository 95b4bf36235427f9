//! Shutdown coordination.

use crate::error::Result;
use crate::types::Event;
use std::sync::atomic::Ordering;

use super::BatchService;

impl BatchService {
    /// Gracefully shut down the service
    ///
    /// 1. Cancels the shared token: the scheduler stops firing, new launches are refused
    ///    and running steps stop at their next chunk boundary
    /// 2. Waits for running jobs, up to `jobs.shutdown_timeout`
    /// 3. Emits [`Event::Shutdown`] and closes the connection pool
    ///
    /// Jobs still running after the timeout are abandoned; their executions are marked
    /// FAILED on the next start and resume from their last committed chunk.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.cancel.cancel();

        let timeout = self.config.jobs.shutdown_timeout;
        match tokio::time::timeout(timeout, self.wait_for_active_jobs()).await {
            Ok(()) => tracing::info!("All running jobs stopped"),
            Err(_) => tracing::warn!(
                active_jobs = self.active_jobs.load(Ordering::SeqCst),
                "Timeout waiting for running jobs, proceeding with shutdown"
            ),
        }

        let _ = self.event_tx.send(Event::Shutdown);
        self.db.pool().close().await;

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_active_jobs(&self) {
        loop {
            let active = self.active_jobs.load(Ordering::SeqCst);
            if active == 0 {
                return;
            }
            tracing::debug!(active, "Waiting for running jobs to stop");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
