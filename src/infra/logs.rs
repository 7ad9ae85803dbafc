//! Job log extraction seam.
//!
//! Extraction itself is handled by an external subsystem; the managers only
//! trigger it before a terminal transition.

use async_trait::async_trait;

use crate::core::ManagerError;

/// Trigger for the log-extraction subsystem.
#[async_trait]
pub trait JobLogExtractor: Send + Sync {
    /// Extract the log of a job into its storage path.
    async fn extract(&self, job_id: &str, log_path: &str, user_id: &str)
        -> Result<(), ManagerError>;
}

/// Extractor that only records the trigger.
pub struct NullLogExtractor;

#[async_trait]
impl JobLogExtractor for NullLogExtractor {
    async fn extract(
        &self,
        job_id: &str,
        log_path: &str,
        user_id: &str,
    ) -> Result<(), ManagerError> {
        tracing::debug!("log extraction for job {job_id} (user {user_id}) into {log_path}");
        Ok(())
    }
}

/// Local path of a job's log file under the storage mount.
pub fn job_log_path(storage_mount_path: &str, job_path: &str) -> String {
    format!(
        "{}/{}/logs/joblog.txt",
        storage_mount_path.trim_end_matches('/'),
        job_path.trim_matches('/')
    )
}
