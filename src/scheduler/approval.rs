//! Approval pass: `unapproved` to `queued`, gated by per-user VC quota.

use chrono::Utc;

use crate::core::{encode_detail, message_detail, AppResult, Job, JobStatus};
use crate::infra::store::JobFields;
use crate::scheduler::latency::{update_job_state_latency, JobState};
use crate::scheduler::Services;

async fn record_latency(services: &Services, job_id: &str, state: JobState, at: chrono::DateTime<Utc>) {
    if let Err(e) =
        update_job_state_latency(services.timing.as_ref(), &services.latency, job_id, state, at)
            .await
    {
        tracing::warn!("latency record for job {job_id} failed: {e}");
    }
}

async fn move_to_queued(services: &Services, job: &Job, message: &str) -> AppResult<()> {
    let fields = JobFields {
        status: Some(JobStatus::Queued),
        status_detail_blob: Some(encode_detail(&message_detail(message))?),
        last_updated: Some(Utc::now()),
        ..JobFields::default()
    };
    services.store.update_job_text_fields(&job.job_id, &fields).await?;
    record_latency(services, &job.job_id, JobState::Approved, Utc::now()).await;
    Ok(())
}

/// Approve one `unapproved` job, or keep it pending with an explanatory
/// detail message. Returns whether the job was approved.
pub async fn approve_job(services: &Services, job: &Job) -> AppResult<bool> {
    let job_id = &job.job_id;
    record_latency(services, job_id, JobState::Created, job.job_time).await;

    let params = job.params()?;
    let requested_gpus = params.total_gpus();

    if params.preemption_allowed {
        tracing::info!("job {job_id} preemptible, approve");
        move_to_queued(services, job, "waiting for available preemptible resource.").await?;
        return Ok(true);
    }

    let vcs = services.store.list_vcs().await?;
    let Some(vc) = vcs.iter().find(|vc| vc.vc_name == job.vc_name) else {
        tracing::warn!("vc {} not existing, job {job_id} rejected", job.vc_name);
        return Ok(false);
    };

    if let Some(user_quota) = vc.parsed_metadata().user_quota {
        let user_jobs = services
            .store
            .get_job_list(
                Some(&job.user_name),
                Some(&job.vc_name),
                &[JobStatus::Running, JobStatus::Queued, JobStatus::Scheduling],
            )
            .await?;

        let mut used_gpus = 0;
        for user_job in &user_jobs {
            let Ok(user_params) = user_job.params() else {
                continue;
            };
            // preemptible GPUs are bonus tokens, excluded from quota
            if user_params.preemption_allowed {
                continue;
            }
            used_gpus += user_params.total_gpus();
        }

        tracing::info!(
            "job {job_id} requires {requested_gpus}, used quota (exclude preemptible GPUs) \
             {used_gpus}, with user quota of {user_quota}"
        );
        if requested_gpus > 0 && user_quota < used_gpus + requested_gpus {
            let message = format!(
                "exceeds the user quota in VC: {used_gpus} (used) + {requested_gpus} \
                 (requested) > {user_quota} (user quota). Will need admin approval."
            );
            tracing::info!("job {job_id} {message}");
            services
                .store
                .update_job_text_fields(
                    job_id,
                    &JobFields {
                        status_detail_blob: Some(encode_detail(&message_detail(message))?),
                        ..JobFields::default()
                    },
                )
                .await?;
            return Ok(false);
        }
    }

    move_to_queued(services, job, "waiting for available resource.").await?;
    Ok(true)
}
