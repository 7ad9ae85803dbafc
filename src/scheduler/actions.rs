//! Post-pass job actions: submit, preempt, scale or explain.

use std::collections::HashMap;

use chrono::Utc;

use crate::core::{
    encode_detail, message_detail, rewrite_resourcegpu, AppResult, ClusterResource, Job,
    JobStatus, ManagerError, SchedulingPolicy,
};
use crate::infra::store::JobFields;
use crate::scheduler::capacity::{cluster_schedulable, vc_schedulables};
use crate::scheduler::latency::{update_job_state_latency, JobState};
use crate::scheduler::passes::{
    mark_inference_guaranteed, mark_inference_preemptable, mark_nonpreemptable_training,
    mark_preemptable_training,
};
use crate::scheduler::working_set::{build_working_set, JobEntry};
use crate::scheduler::Services;

/// One full scheduling pass over the eligible jobs: derive schedulables,
/// build and sort the working set, run passes A through D, then issue at
/// most one action per job.
pub async fn take_job_actions(services: &Services, jobs: &[Job]) -> AppResult<()> {
    let status = services.store.get_cluster_status().await?;
    let mut cluster = cluster_schedulable(&status);
    let mut vcs = vc_schedulables(&status);

    let vc_list = services.store.list_vcs().await?;
    let policies: HashMap<String, SchedulingPolicy> = vc_list
        .iter()
        .map(|vc| (vc.vc_name.clone(), vc.scheduling_policy()))
        .collect();

    let priorities = match services.store.get_job_priorities().await {
        Ok(priorities) => priorities,
        Err(e) => {
            tracing::warn!("fetch job priority table failed: {e}");
            HashMap::new()
        }
    };

    let mut entries = build_working_set(jobs, &priorities, &mut cluster, &mut vcs);

    mark_nonpreemptable_training(&mut entries, &mut cluster, &mut vcs, &policies);
    mark_inference_guaranteed(&mut entries, &mut cluster, &mut vcs);
    mark_preemptable_training(&mut entries, &mut cluster);
    mark_inference_preemptable(&mut entries, &mut cluster);

    tracing::info!("cluster schedulable after this round of scheduling: {cluster}");

    for entry in &mut entries {
        if let Err(e) = apply_one(services, entry, &cluster, &vcs).await {
            tracing::error!("process job {} failed: {e}", entry.job.job_id);
        }
    }
    Ok(())
}

/// Rewrite `resourcegpu` to the granted GPU count of an inference job and
/// persist the blob, so the launcher scales to what was actually admitted.
async fn adjust_job_resource(services: &Services, entry: &mut JobEntry) -> Result<(), ManagerError> {
    let Some(allowed) = &entry.allowed_resource else {
        return Ok(());
    };
    let gpus = allowed
        .gpu
        .iter()
        .next()
        .map(|(_, amount)| amount as i64)
        .unwrap_or(0);
    let blob = rewrite_resourcegpu(&entry.job.params_blob, gpus)?;
    entry.job.params_blob = blob.clone();
    services
        .store
        .update_job_text_fields(
            &entry.job.job_id,
            &JobFields {
                params_blob: Some(blob),
                ..JobFields::default()
            },
        )
        .await?;
    tracing::info!(
        "inference job {} gpu count after adjust is {gpus}",
        entry.job.job_id
    );
    Ok(())
}

async fn apply_one(
    services: &Services,
    entry: &mut JobEntry,
    cluster: &ClusterResource,
    vcs: &HashMap<String, ClusterResource>,
) -> AppResult<()> {
    let job_id = entry.job.job_id.clone();
    let is_inference = entry.training_type.is_inference();

    if is_inference {
        adjust_job_resource(services, entry).await?;
    }

    let live = matches!(entry.status, JobStatus::Scheduling | JobStatus::Running);

    if entry.status == JobStatus::Queued && entry.allowed {
        services.launcher.submit_job(&entry.job).await?;
        if let Err(e) = update_job_state_latency(
            services.timing.as_ref(),
            &services.latency,
            &job_id,
            JobState::Scheduling,
            Utc::now(),
        )
        .await
        {
            tracing::warn!("latency record for job {job_id} failed: {e}");
        }
        tracing::info!("submitting job {job_id} : {:?}", entry.sort_key);
    } else if entry.preemption_allowed && !is_inference && live && !entry.allowed {
        // capacity dropped relative to the prior tick; revoke the bonus
        services
            .launcher
            .kill_job(&job_id, JobStatus::Queued, false)
            .await?;
        tracing::info!("preempting job {job_id} : {:?}", entry.sort_key);
    } else if entry.status == JobStatus::Queued && !entry.allowed {
        let message = match &entry.reason {
            Some(reason) => reason.clone(),
            None => {
                let vc_schedulable = vcs.get(&entry.job.vc_name).cloned().unwrap_or_default();
                format!(
                    "Waiting for resource. Job request {}. VC schedulable {vc_schedulable}. \
                     Cluster schedulable {cluster}",
                    entry.job_resource
                )
            }
        };
        services
            .store
            .update_job_text_fields(
                &job_id,
                &JobFields {
                    status_detail_blob: Some(encode_detail(&message_detail(message))?),
                    ..JobFields::default()
                },
            )
            .await?;
    } else if is_inference && live {
        services.launcher.scale_job(&entry.job).await?;
    }

    Ok(())
}
