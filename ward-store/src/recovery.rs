//! Startup recovery.
//!
//! After a restart, every live watcher gets one `recovery` job so its
//! wallet is picked up by the supervisor and the watcher loop resumes.
//! Individual enqueue failures are logged and skipped; a single bad row
//! must not block the rest of the fleet.

use anyhow::Result;
use tracing::{error, info};

use crate::{jobs::JobTrigger, pool::Store};

impl Store {
    /// Enqueue one `recovery` job per active watcher.
    /// Returns the number of watchers recovered.
    pub async fn recover_active_watchers(&self, max_retries: u32) -> Result<usize> {
        let watchers = self.active_watchers().await?;
        let mut recovered = 0;

        for watcher in &watchers {
            info!(
                "Recovering watcher for {wallet}:{recipient}",
                wallet = watcher.wallet.short_id(),
                recipient = watcher.recipient_id,
            );
            match self
                .enqueue_job(&watcher.wallet, JobTrigger::Recovery, None, None, max_retries)
                .await
            {
                Ok(_) => recovered += 1,
                Err(e) => error!(
                    "Failed to recover watcher {recipient}: {e:#}",
                    recipient = watcher.recipient_id
                ),
            }
        }

        info!("Recovered {recovered} active watcher(s)");
        Ok(recovered)
    }
}
