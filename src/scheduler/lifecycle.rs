//! Status refresh for live jobs, driven by the launcher's report.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::core::{
    detail_with_finished_time, encode_detail, AppResult, DetailEntry, Job, JobStatus,
};
use crate::infra::launcher::LaunchResult;
use crate::infra::logs::job_log_path;
use crate::infra::notify::{new_job_killed_message, new_job_state_change_message};
use crate::infra::store::JobFields;
use crate::scheduler::latency::{update_job_state_latency, JobState};
use crate::scheduler::Services;

/// Probation map for jobs whose workload reports `Unknown` or `NotFound`.
///
/// Process-local by design: a manager restart resets every window. Owned by
/// the loop so tests can inject a fresh instance.
pub struct ProbationTracker {
    window: Duration,
    entries: HashMap<String, DateTime<Utc>>,
}

impl ProbationTracker {
    /// Tracker with the given probation window in seconds.
    pub fn new(window_secs: i64) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Note an unusual sighting at `now`. Returns true when the probation
    /// window has expired and the entry has been consumed.
    pub fn note(&mut self, job_id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(job_id) {
            None => {
                self.entries.insert(job_id.to_string(), now);
                false
            }
            Some(first_seen) if now - *first_seen > self.window => {
                self.entries.remove(job_id);
                true
            }
            Some(_) => false,
        }
    }

    /// Drop a job's probation entry after a healthy sighting.
    pub fn clear(&mut self, job_id: &str) {
        self.entries.remove(job_id);
    }

    /// Whether a job is currently on probation.
    pub fn is_tracking(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }
}

async fn finalize_job(
    services: &Services,
    job: &Job,
    status: JobStatus,
    status_word: &str,
    error_msg: Option<String>,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let detail = detail_with_finished_time(job.decode_detail(), status_word, now);
    let fields = JobFields {
        status: Some(status),
        status_detail_blob: Some(encode_detail(&detail)?),
        last_updated: Some(now),
        error_msg,
        ..JobFields::default()
    };
    services.store.update_job_text_fields(&job.job_id, &fields).await?;
    services.launcher.delete_job(&job.job_id, true).await?;
    Ok(())
}

/// Refresh one `scheduling`/`running` job from the launcher's report and
/// issue the corresponding transition, kill, or detail update.
pub async fn refresh_job_status(
    services: &Services,
    probation: &mut ProbationTracker,
    storage_mount_path: &str,
    job: &Job,
) -> AppResult<()> {
    if !matches!(job.status, JobStatus::Scheduling | JobStatus::Running) {
        return Ok(());
    }
    let job_id = &job.job_id;
    let params = job.params()?;
    let status = services.launcher.get_job_status(job_id).await?;
    tracing::info!("job status: {job_id} {}", status.result.as_str());

    let log_path = job_log_path(storage_mount_path, &params.job_path);
    let user_id = params.user_id();
    let now = Utc::now();

    match status.result {
        LaunchResult::Succeeded => {
            services.logs.extract(job_id, &log_path, &user_id).await?;
            finalize_job(services, job, JobStatus::Finished, "finished", None, now).await?;
            services.notifier.notify(new_job_state_change_message(
                &job.user_name,
                job_id,
                status.result.as_str(),
            ));
        }
        LaunchResult::Running => {
            if let Err(e) = update_job_state_latency(
                services.timing.as_ref(),
                &services.latency,
                job_id,
                JobState::Running,
                now,
            )
            .await
            {
                tracing::warn!("latency record for job {job_id} failed: {e}");
            }

            // effective queue time for the max-time check below: the moment
            // the job turned running, or the stored one if it already was
            let mut last_updated = job.last_updated;
            if job.status != JobStatus::Running {
                let started_at = now.with_timezone(&chrono::Local).to_rfc3339();
                let detail = vec![DetailEntry {
                    message: Some(format!("started at: {started_at}")),
                    started_at: Some(started_at),
                    ..DetailEntry::default()
                }];
                let fields = JobFields {
                    status: Some(JobStatus::Running),
                    status_detail_blob: Some(encode_detail(&detail)?),
                    last_updated: Some(now),
                    ..JobFields::default()
                };
                services.store.update_job_text_fields(job_id, &fields).await?;
                services.notifier.notify(new_job_state_change_message(
                    &job.user_name,
                    job_id,
                    status.result.as_str(),
                ));
                last_updated = now;
            }

            match params.max_time() {
                None => {
                    if params.max_time_sec.is_some() {
                        tracing::info!(
                            "unknown maxTimeSec {:?} for job {job_id}",
                            params.max_time_sec
                        );
                    }
                }
                Some(max_time) => {
                    if last_updated.timestamp() + max_time < now.timestamp() {
                        tracing::info!(
                            "killing job {job_id} for its running time exceed maxTimeSec \
                             {max_time}s"
                        );
                        let error_msg = format!("running exceed pre-defined {max_time}s");
                        services
                            .store
                            .update_job_text_fields(
                                job_id,
                                &JobFields {
                                    error_msg: Some(error_msg.clone()),
                                    ..JobFields::default()
                                },
                            )
                            .await?;
                        services
                            .launcher
                            .kill_job(job_id, JobStatus::Killed, true)
                            .await?;
                        services.notifier.notify(new_job_killed_message(
                            &job.user_name,
                            job_id,
                            &error_msg,
                        ));
                    }
                }
            }
        }
        LaunchResult::Failed => {
            if params.debug_enabled() && (now - job.job_time).num_seconds() < 60 {
                tracing::info!("leave job {job_id} there for debug for 60s");
                return Ok(());
            }
            tracing::warn!("job {job_id} fails, cleaning");
            services.notifier.notify(new_job_state_change_message(
                &job.user_name,
                job_id,
                status.result.as_str(),
            ));
            services.logs.extract(job_id, &log_path, &user_id).await?;
            finalize_job(
                services,
                job,
                JobStatus::Failed,
                "failed",
                Some(status.diagnostics.clone()),
                now,
            )
            .await?;
        }
        LaunchResult::Unknown | LaunchResult::NotFound => {
            if probation.note(job_id, now) {
                // reset endpoints so they restart when the job is ready
                let endpoints = services.store.get_job_endpoints(job_id).await?;
                for mut endpoint in endpoints {
                    endpoint.status = "pending".to_string();
                    tracing::debug!(
                        "reset endpoint status to 'pending': {}",
                        endpoint.endpoint_id
                    );
                    services.store.update_endpoint(&endpoint).await?;
                }
                tracing::warn!(
                    "job {job_id} fails in Kubernetes as {}, delete and re-submit",
                    status.result.as_str()
                );
                services
                    .launcher
                    .kill_job(job_id, JobStatus::Queued, false)
                    .await?;
                services.notifier.notify(new_job_state_change_message(
                    &job.user_name,
                    job_id,
                    status.result.as_str(),
                ));
            } else if probation.is_tracking(job_id) {
                tracing::warn!(
                    "job status {} for job {job_id}, probation running",
                    status.result.as_str()
                );
            }
        }
        LaunchResult::Pending => {
            let detail = services.kube.get_job_status_detail(job_id).await?;
            let fields = JobFields {
                status: Some(JobStatus::Scheduling),
                status_detail_blob: Some(encode_detail(&detail)?),
                ..JobFields::default()
            };
            services.store.update_job_text_fields(job_id, &fields).await?;
        }
    }

    if !matches!(status.result, LaunchResult::Unknown | LaunchResult::NotFound) {
        probation.clear(job_id);
    }
    Ok(())
}
