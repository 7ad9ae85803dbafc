//! The four ordered admission passes.
//!
//! Passes run in strict order over the sorted working set, mutating
//! `allowed` and deducting from the schedulables as admissions are granted:
//!
//! A. non-preemptable training, per-VC policy (FIFO head-of-line or RF)
//! B. guaranteed portion of queued inference jobs
//! C. preemptable training against cluster-wide leftovers only
//! D. elastic portion of admitted inference jobs, fractionally if short

use std::collections::HashMap;

use crate::core::{ClusterResource, JobStatus, ResourceAxis, SchedulingPolicy};
use crate::scheduler::working_set::JobEntry;

/// Pass A: admit non-preemptable training jobs subject to both cluster and
/// VC schedulables, honoring the per-VC policy.
pub fn mark_nonpreemptable_training(
    entries: &mut [JobEntry],
    cluster: &mut ClusterResource,
    vcs: &mut HashMap<String, ClusterResource>,
    policies: &HashMap<String, SchedulingPolicy>,
) {
    // vc name -> job id of the first blocking job in that vc
    let mut stop_scheduling: HashMap<String, String> = HashMap::new();

    for entry in entries.iter_mut() {
        if entry.preemption_allowed || entry.training_type.is_inference() {
            continue;
        }

        let job_id = entry.job.job_id.clone();
        let vc_name = entry.job.vc_name.clone();
        let Some(vc_schedulable) = vcs.get_mut(&vc_name) else {
            tracing::warn!("vc {vc_name} does not exist as provided by {job_id}, ignore this job");
            continue;
        };

        let fits = cluster.ge(&entry.job_resource) && vc_schedulable.ge(&entry.job_resource);
        let policy = policies
            .get(&vc_name)
            .copied()
            .unwrap_or(SchedulingPolicy::RunnableFirst);

        match policy {
            SchedulingPolicy::Fifo => {
                if let Some(blocking) = stop_scheduling.get(&vc_name) {
                    entry.reason = Some(format!(
                        "blocked by job with higher priority/earlier time {blocking}"
                    ));
                    tracing::info!(
                        "disallow non-preemptable job {job_id} from vc {vc_name}: \
                         blocked by {blocking}"
                    );
                } else if fits {
                    *vc_schedulable -= &entry.job_resource;
                    *cluster -= &entry.job_resource;
                    entry.allowed = true;
                    tracing::info!(
                        "allow non-preemptable job {job_id} from {vc_name}, \
                         job resource {}, policy FIFO",
                        entry.job_resource
                    );
                } else {
                    entry.reason = Some(format!(
                        "resource not enough, required {}, vc schedulable {vc_schedulable}, \
                         cluster schedulable {cluster}",
                        entry.job_resource
                    ));
                    tracing::info!(
                        "disallow non-preemptable job {job_id} from vc {vc_name}: \
                         resource not enough, policy FIFO"
                    );
                    // head-of-line: every later non-preemptable job in this
                    // vc is blocked this tick
                    stop_scheduling.insert(vc_name, job_id);
                }
            }
            SchedulingPolicy::RunnableFirst => {
                if fits {
                    *vc_schedulable -= &entry.job_resource;
                    *cluster -= &entry.job_resource;
                    entry.allowed = true;
                    tracing::info!(
                        "allow non-preemptable job {job_id} from {vc_name}, \
                         job resource {}, policy RF",
                        entry.job_resource
                    );
                } else {
                    tracing::info!(
                        "disallow non-preemptable job {job_id} from vc {vc_name}: \
                         requiring {}, vc schedulable {vc_schedulable}, \
                         cluster schedulable {cluster}, policy RF",
                        entry.job_resource
                    );
                }
            }
        }
    }
}

/// Pass B: admit the guaranteed portion of queued inference jobs.
pub fn mark_inference_guaranteed(
    entries: &mut [JobEntry],
    cluster: &mut ClusterResource,
    vcs: &mut HashMap<String, ClusterResource>,
) {
    for entry in entries.iter_mut() {
        if !entry.training_type.is_inference() || entry.status != JobStatus::Queued {
            continue;
        }

        let job_id = entry.job.job_id.clone();
        let vc_name = entry.job.vc_name.clone();
        let Some(vc_schedulable) = vcs.get_mut(&vc_name) else {
            tracing::warn!("vc {vc_name} does not exist as provided by {job_id}, ignore this job");
            continue;
        };

        if cluster.ge(&entry.job_resource) && vc_schedulable.ge(&entry.job_resource) {
            *vc_schedulable -= &entry.job_resource;
            *cluster -= &entry.job_resource;
            entry.allowed = true;
            entry.allowed_resource = Some(entry.job_resource.clone());
            tracing::info!(
                "allow inference job {job_id} non-preemptable part from {vc_name}, \
                 job resource {}",
                entry.job_resource
            );
        } else {
            tracing::info!(
                "disallow inference job {job_id} non-preemptable part from vc {vc_name}: \
                 requiring {}, vc schedulable {vc_schedulable}, cluster schedulable {cluster}",
                entry.job_resource
            );
        }
    }
}

/// Pass C: admit preemptable training against cluster-wide leftovers only.
/// Preemptible tokens are global bonus, so no VC deduction and no
/// head-of-line fairness.
pub fn mark_preemptable_training(entries: &mut [JobEntry], cluster: &mut ClusterResource) {
    for entry in entries.iter_mut() {
        if entry.training_type.is_inference() {
            continue;
        }
        if !entry.preemption_allowed || entry.allowed {
            continue;
        }

        let job_id = &entry.job.job_id;
        if cluster.ge(&entry.job_resource) {
            *cluster -= &entry.job_resource;
            entry.allowed = true;
            tracing::info!(
                "allow preemptable job {job_id}, used job resource {}",
                entry.job_resource
            );
        } else {
            tracing::info!(
                "disallow preemptable job {job_id}, insufficient cluster resource: \
                 cluster schedulable {cluster}, required {}",
                entry.job_resource
            );
        }
    }
}

/// Proportional fractional allocation anchored on the scarcest axis (GPU).
fn fractional_allocation(
    preemptable: &ClusterResource,
    cluster: &ClusterResource,
) -> ClusterResource {
    let Some(sku) = preemptable.gpu.first_sku().map(str::to_string) else {
        return ClusterResource::new();
    };
    let gpu_request = preemptable.gpu.get(&sku);
    if gpu_request <= 0.0 {
        return ClusterResource::new();
    }
    let cpu_request = preemptable.cpu.get(&sku);
    let memory_request = preemptable.memory.get(&sku);
    let schedulable_gpu = gpu_request.min(cluster.gpu.get(&sku));
    ClusterResource::from_axes(
        ResourceAxis::from_pairs([(sku.clone(), schedulable_gpu * cpu_request / gpu_request)]),
        ResourceAxis::from_pairs([(sku.clone(), schedulable_gpu * memory_request / gpu_request)]),
        ResourceAxis::from_pairs([(sku, schedulable_gpu)]),
    )
}

/// Pass D: grant the elastic portion of inference jobs admitted in pass B.
/// When the cluster cannot cover the full request, a fractional allocation
/// is computed; if it degenerates to an empty GPU or CPU axis the elastic
/// portion is denied while the guaranteed portion stays admitted.
pub fn mark_inference_preemptable(entries: &mut [JobEntry], cluster: &mut ClusterResource) {
    for entry in entries.iter_mut() {
        if !entry.training_type.is_inference() || !entry.allowed {
            continue;
        }
        let Some(preemptable) = entry.preemptable_resource.clone() else {
            continue;
        };

        let job_id = entry.job.job_id.clone();
        let schedulable = if cluster.ge(&preemptable) {
            preemptable.clone()
        } else {
            fractional_allocation(&preemptable, cluster)
        };

        if schedulable.has_empty_gpu_or_cpu() {
            tracing::info!(
                "disallow inference job {job_id} preemptable part: \
                 cluster schedulable {cluster}, job preemptable resource {preemptable}, \
                 schedulable resource {schedulable}"
            );
        } else {
            tracing::info!(
                "allow inference job {job_id} preemptable part: \
                 cluster schedulable {cluster}, job preemptable resource {preemptable}, \
                 schedulable resource {schedulable}"
            );
            entry.allowed = true;
            *cluster -= &schedulable;
            match &mut entry.allowed_resource {
                Some(allowed) => *allowed += &schedulable,
                None => entry.allowed_resource = Some(schedulable),
            }
        }
    }
}
