//! The job manager control loops.
//!
//! Two identically-structured processes run this loop, differentiated by
//! the `--status` argument: one owns the per-job action statuses
//! (`unapproved,scheduling,running,killing,pausing`), the other owns
//! `queued` and runs the scheduling pass. Each sleeps one second between
//! iterations; nothing inside the loop exits the process.

use std::time::Duration;

use crate::core::{AppResult, JobStatus, ManagerError};
use crate::scheduler::{
    approve_job, refresh_job_status, take_job_actions, ProbationTracker, Services,
};

/// Seconds a job may report `Unknown`/`NotFound` before it is requeued.
pub const PROBATION_SECS: i64 = 30;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One job manager loop instance.
pub struct JobManagerLoop {
    services: Services,
    probation: ProbationTracker,
    storage_mount_path: String,
    target_statuses: Vec<JobStatus>,
}

impl JobManagerLoop {
    /// Build a loop for the comma-separated `--status` argument. `queued`
    /// selects the scheduling pass.
    pub fn new(
        services: Services,
        storage_mount_path: impl Into<String>,
        status_arg: &str,
    ) -> Result<Self, ManagerError> {
        let mut target_statuses = Vec::new();
        for part in status_arg.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match JobStatus::parse(part) {
                Some(status) => target_statuses.push(status),
                None => {
                    return Err(ManagerError::Config(format!("unknown job status {part}")));
                }
            }
        }
        if target_statuses.is_empty() {
            return Err(ManagerError::Config("no target status given".to_string()));
        }
        Ok(Self {
            services,
            probation: ProbationTracker::new(PROBATION_SECS),
            storage_mount_path: storage_mount_path.into(),
            target_statuses,
        })
    }

    fn is_scheduling_loop(&self) -> bool {
        self.target_statuses == [JobStatus::Queued]
    }

    /// One iteration over the owned statuses.
    pub async fn tick(&mut self) -> AppResult<()> {
        // wait for workload mutations from the previous batch to settle
        self.services.launcher.wait_tasks_done().await;

        if self.is_scheduling_loop() {
            let jobs = self
                .services
                .store
                .get_job_list(
                    None,
                    None,
                    &[JobStatus::Queued, JobStatus::Scheduling, JobStatus::Running],
                )
                .await?;
            take_job_actions(&self.services, &jobs).await?;
            return Ok(());
        }

        let jobs = self
            .services
            .store
            .get_job_list(None, None, &self.target_statuses)
            .await?;
        tracing::info!("updating status for {} jobs", jobs.len());

        for job in &jobs {
            tracing::info!("processing job: {}, status: {}", job.job_id, job.status.as_str());
            let outcome = match job.status {
                JobStatus::Killing => self
                    .services
                    .launcher
                    .kill_job(&job.job_id, JobStatus::Killed, true)
                    .await
                    .map_err(Into::into),
                JobStatus::Pausing => self
                    .services
                    .launcher
                    .kill_job(&job.job_id, JobStatus::Paused, true)
                    .await
                    .map_err(Into::into),
                JobStatus::Running | JobStatus::Scheduling => {
                    refresh_job_status(
                        &self.services,
                        &mut self.probation,
                        &self.storage_mount_path,
                        job,
                    )
                    .await
                }
                JobStatus::Unapproved => {
                    approve_job(&self.services, job).await.map(|_| ())
                }
                other => {
                    tracing::error!(
                        "unknown job status {} for job {}",
                        other.as_str(),
                        job.job_id
                    );
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                // abandon the tick for this job only
                tracing::error!("processing job {} failed: {e}", job.job_id);
            }
        }
        Ok(())
    }

    /// Run until process exit, one tick per second.
    pub async fn run(mut self) {
        self.services.launcher.start().await;
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!("process jobs failed: {e}");
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }
}
