//! Per-tick scheduling working set.
//!
//! Every eligible job is parsed, keyed and sorted; resources of work that is
//! already live and not revocable are deducted up front.

use std::collections::HashMap;

use crate::core::{ClusterResource, Job, JobParams, JobStatus, TrainingType};

/// Priority assumed when the priority table has no entry for a job.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Composite admission key, sorted ascending (lower schedules first):
/// `(preemptible, inference, status_rank, 999999 - priority, queue_time)`.
pub type SortKey = (u8, u8, u8, i64, i64);

/// One job in the scheduling working set.
#[derive(Debug, Clone)]
pub struct JobEntry {
    /// The underlying job row.
    pub job: Job,
    /// Parsed parameter blob.
    pub params: JobParams,
    /// Whether the job may be preempted.
    pub preemption_allowed: bool,
    /// Declared training type.
    pub training_type: TrainingType,
    /// Guaranteed resource request.
    pub job_resource: ClusterResource,
    /// Elastic portion of an inference job.
    pub preemptable_resource: Option<ClusterResource>,
    /// Admission sort key.
    pub sort_key: SortKey,
    /// Admission decision for this tick.
    pub allowed: bool,
    /// Resource actually granted (inference jobs only).
    pub allowed_resource: Option<ClusterResource>,
    /// Status at the start of the tick.
    pub status: JobStatus,
    /// Denial reason to surface to the user, if any.
    pub reason: Option<String>,
}

fn status_rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Running => 0,
        JobStatus::Scheduling => 1,
        _ => 2,
    }
}

/// Build and sort the working set from the eligible jobs, deducting live
/// non-revocable work from `cluster` and `vcs` as it is encountered.
///
/// Non-preemptable `scheduling`/`running` jobs are already admitted; their
/// resources are deducted and they leave the working set. Preemptable
/// inference jobs also deduct their guaranteed portion but stay, because
/// their elastic portion is resized every tick.
pub fn build_working_set(
    jobs: &[Job],
    priorities: &HashMap<String, i64>,
    cluster: &mut ClusterResource,
    vcs: &mut HashMap<String, ClusterResource>,
) -> Vec<JobEntry> {
    let mut entries = Vec::new();

    for job in jobs {
        if !matches!(
            job.status,
            JobStatus::Queued | JobStatus::Scheduling | JobStatus::Running
        ) {
            continue;
        }

        let params = match job.params() {
            Ok(params) => params,
            Err(e) => {
                tracing::error!("job {}: unreadable params ({e}), skipping", job.job_id);
                continue;
            }
        };

        let Some(vc_schedulable) = vcs.get_mut(&job.vc_name) else {
            tracing::warn!(
                "vc {} does not exist as provided by {}, ignore this job",
                job.vc_name,
                job.job_id
            );
            continue;
        };

        let preemption_allowed = params.preemption_allowed;
        let training_type = params.jobtrainingtype;
        let job_resource = params.resource_request();
        let preemptable_resource = params.preemptable_request();

        let mut allowed = false;
        let mut allowed_resource = None;

        let live = matches!(job.status, JobStatus::Scheduling | JobStatus::Running);
        if live && (!preemption_allowed || training_type.is_inference()) {
            // live non-revocable work is accounted before any admission pass
            *vc_schedulable -= &job_resource;
            *cluster -= &job_resource;
            if !preemption_allowed {
                continue;
            }
            allowed = true;
            allowed_resource = Some(job_resource.clone());
        }

        let priority = priorities
            .get(&job.job_id)
            .copied()
            .unwrap_or(DEFAULT_PRIORITY);
        let sort_key = (
            u8::from(preemption_allowed),
            u8::from(training_type.sorts_as_inference()),
            status_rank(job.status),
            999_999 - priority,
            job.last_updated.timestamp(),
        );

        entries.push(JobEntry {
            job: job.clone(),
            params,
            preemption_allowed,
            training_type,
            job_resource,
            preemptable_resource,
            sort_key,
            allowed,
            allowed_resource,
            status: job.status,
            reason: None,
        });
    }

    entries.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceAxis;
    use crate::util::encoding::b64encode;
    use chrono::{TimeZone, Utc};

    fn job(id: &str, status: JobStatus, params_json: &str, queue_time: i64) -> Job {
        Job {
            job_id: id.to_string(),
            user_name: "u".to_string(),
            vc_name: "v1".to_string(),
            status,
            params_blob: b64encode(params_json),
            job_time: Utc.timestamp_opt(queue_time, 0).unwrap(),
            last_updated: Utc.timestamp_opt(queue_time, 0).unwrap(),
            error_msg: String::new(),
            status_detail_blob: None,
        }
    }

    fn capacity(gpus: f64) -> ClusterResource {
        ClusterResource::from_axes(
            ResourceAxis::from_pairs([("A100", 1000.0)]),
            ResourceAxis::from_pairs([("A100", 1000.0)]),
            ResourceAxis::from_pairs([("A100", gpus)]),
        )
    }

    #[test]
    fn sort_key_orders_the_tiers() {
        let jobs = vec![
            job(
                "preemptable",
                JobStatus::Queued,
                r#"{"resourcegpu": 1, "gpuType": "A100", "preemptionAllowed": true}"#,
                100,
            ),
            job(
                "inference",
                JobStatus::Queued,
                r#"{"resourcegpu": 1, "gpuType": "A100", "jobtrainingtype": "InferenceJob"}"#,
                100,
            ),
            job(
                "training-late",
                JobStatus::Queued,
                r#"{"resourcegpu": 1, "gpuType": "A100"}"#,
                200,
            ),
            job(
                "training-early",
                JobStatus::Queued,
                r#"{"resourcegpu": 1, "gpuType": "A100"}"#,
                100,
            ),
        ];
        let mut cluster = capacity(8.0);
        let mut vcs = HashMap::from([("v1".to_string(), capacity(8.0))]);
        let entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);
        let order: Vec<&str> = entries.iter().map(|e| e.job.job_id.as_str()).collect();
        assert_eq!(
            order,
            ["training-early", "training-late", "inference", "preemptable"]
        );
    }

    #[test]
    fn priority_beats_queue_time() {
        let jobs = vec![
            job("early-low", JobStatus::Queued, r#"{"resourcegpu": 1, "gpuType": "A100"}"#, 100),
            job("late-high", JobStatus::Queued, r#"{"resourcegpu": 1, "gpuType": "A100"}"#, 200),
        ];
        let priorities = HashMap::from([("late-high".to_string(), 200_i64)]);
        let mut cluster = capacity(8.0);
        let mut vcs = HashMap::from([("v1".to_string(), capacity(8.0))]);
        let entries = build_working_set(&jobs, &priorities, &mut cluster, &mut vcs);
        assert_eq!(entries[0].job.job_id, "late-high");
    }

    #[test]
    fn live_nonpreemptable_work_is_deducted_and_removed() {
        let jobs = vec![job(
            "live",
            JobStatus::Running,
            r#"{"resourcegpu": 2, "gpuType": "A100"}"#,
            100,
        )];
        let mut cluster = capacity(8.0);
        let mut vcs = HashMap::from([("v1".to_string(), capacity(8.0))]);
        let entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);
        assert!(entries.is_empty());
        assert!((cluster.gpu.get("A100") - 6.0).abs() < 1e-9);
        assert!((vcs["v1"].gpu.get("A100") - 6.0).abs() < 1e-9);
    }

    #[test]
    fn live_preemptable_inference_stays_admitted() {
        let jobs = vec![job(
            "inf",
            JobStatus::Running,
            r#"{"resourcegpu": 2, "gpuType": "A100", "preemptionAllowed": true,
                "jobtrainingtype": "InferenceJob"}"#,
            100,
        )];
        let mut cluster = capacity(8.0);
        let mut vcs = HashMap::from([("v1".to_string(), capacity(8.0))]);
        let entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].allowed);
        assert!(entries[0].allowed_resource.is_some());
        assert!((cluster.gpu.get("A100") - 6.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_vc_is_skipped() {
        let mut jobs = vec![job("j", JobStatus::Queued, r#"{"resourcegpu": 1}"#, 100)];
        jobs[0].vc_name = "ghost".to_string();
        let mut cluster = capacity(8.0);
        let mut vcs = HashMap::from([("v1".to_string(), capacity(8.0))]);
        let entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);
        assert!(entries.is_empty());
    }
}
