//! The repair manager control loop.

use std::time::Duration;

use crate::repair::RepairManager;

/// Runs the repair state machine on a fixed interval.
pub struct RepairLoop {
    manager: RepairManager,
    interval: Duration,
}

impl RepairLoop {
    /// Loop over `manager` with `interval_secs` between ticks.
    pub fn new(manager: RepairManager, interval_secs: u64) -> Self {
        Self {
            manager,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Run until process exit. Tick failures are logged and retried on the
    /// next interval.
    pub async fn run(self) {
        loop {
            if let Err(e) = self.manager.tick().await {
                tracing::error!("repair tick failed: {e}");
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
