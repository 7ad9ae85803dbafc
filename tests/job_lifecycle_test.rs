//! Approval, status refresh and kill paths of the job manager.

use std::sync::Arc;

use chrono::{Duration, Utc};

use prometheus_cluster_manager::core::{Job, JobStatus, VirtualCluster};
use prometheus_cluster_manager::infra::kube::InMemoryKube;
use prometheus_cluster_manager::infra::launcher::{
    InProcessLauncher, LaunchResult, LaunchStatus,
};
use prometheus_cluster_manager::infra::logs::NullLogExtractor;
use prometheus_cluster_manager::infra::notify::{CollectingSink, Notifier};
use prometheus_cluster_manager::infra::store::{DataStore, InMemoryStore, JobEndpoint};
use prometheus_cluster_manager::infra::timing::InMemoryTimingStore;
use prometheus_cluster_manager::scheduler::latency::StateLatency;
use prometheus_cluster_manager::scheduler::{
    approve_job, refresh_job_status, ProbationTracker, Services,
};
use prometheus_cluster_manager::util::encoding::{b64decode, b64encode};

struct Harness {
    store: Arc<InMemoryStore>,
    launcher: Arc<InProcessLauncher>,
    sink: Arc<CollectingSink>,
    services: Services,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let launcher = Arc::new(InProcessLauncher::new(store.clone()));
    let sink = Arc::new(CollectingSink::new());
    let services = Services {
        store: store.clone(),
        launcher: launcher.clone(),
        kube: Arc::new(InMemoryKube::new()),
        timing: Arc::new(InMemoryTimingStore::new()),
        latency: StateLatency::unregistered(),
        notifier: Notifier::spawn(sink.clone()),
        logs: Arc::new(NullLogExtractor),
    };
    Harness {
        store,
        launcher,
        sink,
        services,
    }
}

fn job(id: &str, status: JobStatus, params_json: &str) -> Job {
    let now = Utc::now();
    Job {
        job_id: id.to_string(),
        user_name: "alice".to_string(),
        vc_name: "v1".to_string(),
        status,
        params_blob: b64encode(params_json),
        job_time: now,
        last_updated: now,
        error_msg: String::new(),
        status_detail_blob: None,
    }
}

fn detail_text(job: &Job) -> String {
    job.status_detail_blob
        .as_ref()
        .map(|blob| b64decode(blob).unwrap())
        .unwrap_or_default()
}

#[tokio::test]
async fn approval_rejects_quota_excess() {
    let h = harness();
    h.store.put_vc(VirtualCluster {
        vc_name: "v1".to_string(),
        metadata: r#"{"user_quota": 8}"#.to_string(),
    });
    h.store.put_job(job(
        "running-6",
        JobStatus::Running,
        r#"{"resourcegpu": 6, "gpuType": "A100"}"#,
    ));
    let new_job = job(
        "wants-4",
        JobStatus::Unapproved,
        r#"{"resourcegpu": 4, "gpuType": "A100"}"#,
    );
    h.store.put_job(new_job.clone());

    let approved = approve_job(&h.services, &new_job).await.unwrap();
    assert!(!approved);

    let stored = h.store.job("wants-4").unwrap();
    assert_eq!(stored.status, JobStatus::Unapproved);
    let detail = detail_text(&stored);
    assert!(detail.contains(
        "exceeds the user quota in VC: 6 (used) + 4 (requested) > 8 (user quota)"
    ));
}

#[tokio::test]
async fn approval_ignores_preemptible_usage_against_quota() {
    let h = harness();
    h.store.put_vc(VirtualCluster {
        vc_name: "v1".to_string(),
        metadata: r#"{"user_quota": 8}"#.to_string(),
    });
    // 6 preemptible GPUs in flight do not count against the quota
    h.store.put_job(job(
        "bonus-6",
        JobStatus::Running,
        r#"{"resourcegpu": 6, "gpuType": "A100", "preemptionAllowed": true}"#,
    ));
    let new_job = job(
        "wants-8",
        JobStatus::Unapproved,
        r#"{"resourcegpu": 8, "gpuType": "A100"}"#,
    );
    h.store.put_job(new_job.clone());

    assert!(approve_job(&h.services, &new_job).await.unwrap());
    assert_eq!(h.store.job("wants-8").unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn approval_fast_paths_preemptible_jobs() {
    let h = harness();
    let new_job = job(
        "bonus",
        JobStatus::Unapproved,
        r#"{"resourcegpu": 2, "gpuType": "A100", "preemptionAllowed": true}"#,
    );
    h.store.put_job(new_job.clone());

    assert!(approve_job(&h.services, &new_job).await.unwrap());
    let stored = h.store.job("bonus").unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert!(detail_text(&stored).contains("waiting for available preemptible resource."));
}

#[tokio::test]
async fn approval_rejects_missing_vc() {
    let h = harness();
    let new_job = job("lost", JobStatus::Unapproved, r#"{"resourcegpu": 1}"#);
    h.store.put_job(new_job.clone());

    assert!(!approve_job(&h.services, &new_job).await.unwrap());
    assert_eq!(h.store.job("lost").unwrap().status, JobStatus::Unapproved);
}

#[tokio::test]
async fn max_time_exceeded_kills_the_job() {
    let h = harness();
    let mut running = job(
        "late",
        JobStatus::Running,
        r#"{"resourcegpu": 1, "gpuType": "A100", "maxTimeSec": 3600}"#,
    );
    running.last_updated = Utc::now() - Duration::seconds(3601);
    h.store.put_job(running.clone());
    h.launcher
        .set_status("late", LaunchStatus::of(LaunchResult::Running));

    let mut probation = ProbationTracker::new(30);
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();

    let stored = h.store.job("late").unwrap();
    assert_eq!(stored.status, JobStatus::Killed);
    assert_eq!(stored.error_msg, "running exceed pre-defined 3600s");
    // give the notifier consumer task a moment to drain the queue
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let killed_messages: Vec<_> = h
        .sink
        .messages()
        .into_iter()
        .filter(|m| m.subject.contains("killed"))
        .collect();
    assert_eq!(killed_messages.len(), 1);
}

#[tokio::test]
async fn succeeded_job_is_finalized() {
    let h = harness();
    let running = job("done", JobStatus::Running, r#"{"resourcegpu": 1}"#);
    h.store.put_job(running.clone());
    h.launcher
        .set_status("done", LaunchStatus::of(LaunchResult::Succeeded));

    let mut probation = ProbationTracker::new(30);
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();

    let stored = h.store.job("done").unwrap();
    assert_eq!(stored.status, JobStatus::Finished);
    assert!(detail_text(&stored).contains("finishedAt"));
}

#[tokio::test]
async fn failed_debug_job_is_left_for_post_mortem() {
    let h = harness();
    let running = job(
        "debuggable",
        JobStatus::Running,
        r#"{"resourcegpu": 1, "debug": true}"#,
    );
    h.store.put_job(running.clone());
    h.launcher.set_status(
        "debuggable",
        LaunchStatus {
            result: LaunchResult::Failed,
            detail: serde_json::Value::Null,
            diagnostics: "OOM".to_string(),
        },
    );

    let mut probation = ProbationTracker::new(30);
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();

    // fresh failure of a debug job stays around for post-mortem
    assert_eq!(h.store.job("debuggable").unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn failed_job_records_diagnostics() {
    let h = harness();
    let mut running = job("broken", JobStatus::Running, r#"{"resourcegpu": 1}"#);
    running.job_time = Utc::now() - Duration::seconds(600);
    h.store.put_job(running.clone());
    h.launcher.set_status(
        "broken",
        LaunchStatus {
            result: LaunchResult::Failed,
            detail: serde_json::Value::Null,
            diagnostics: "CUDA error: device lost".to_string(),
        },
    );

    let mut probation = ProbationTracker::new(30);
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();

    let stored = h.store.job("broken").unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_msg, "CUDA error: device lost");
}

#[tokio::test]
async fn unknown_status_requeues_after_probation() {
    let h = harness();
    let running = job("ghost", JobStatus::Running, r#"{"resourcegpu": 1}"#);
    h.store.put_job(running.clone());
    h.store.put_endpoint(JobEndpoint {
        endpoint_id: "ssh".to_string(),
        job_id: "ghost".to_string(),
        status: "running".to_string(),
    });
    h.launcher
        .set_status("ghost", LaunchStatus::of(LaunchResult::Unknown));

    // zero window so the second sighting expires the probation
    let mut probation = ProbationTracker::new(0);

    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();
    assert_eq!(h.store.job("ghost").unwrap().status, JobStatus::Running);
    assert!(probation.is_tracking("ghost"));

    let queue_time = h.store.job("ghost").unwrap().last_updated;
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();

    let stored = h.store.job("ghost").unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    // the queue position survives the resubmit
    assert_eq!(stored.last_updated, queue_time);
    let endpoints = h.store.get_job_endpoints("ghost").await.unwrap();
    assert!(endpoints.iter().all(|e| e.status == "pending"));
}

#[tokio::test]
async fn probation_clears_when_status_recovers() {
    let h = harness();
    let running = job("flaky", JobStatus::Running, r#"{"resourcegpu": 1}"#);
    h.store.put_job(running.clone());
    h.launcher
        .set_status("flaky", LaunchStatus::of(LaunchResult::Unknown));

    let mut probation = ProbationTracker::new(30);
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();
    assert!(probation.is_tracking("flaky"));

    h.launcher
        .set_status("flaky", LaunchStatus::of(LaunchResult::Running));
    refresh_job_status(&h.services, &mut probation, "/storage", &running)
        .await
        .unwrap();
    assert!(!probation.is_tracking("flaky"));
    assert_eq!(h.store.job("flaky").unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn pending_job_gets_pod_detail() {
    let h = harness();
    let kube = Arc::new(InMemoryKube::new());
    kube.put_pod(prometheus_cluster_manager::infra::kube::KubePod {
        name: "pod-0".to_string(),
        node_name: Some("worker-1".to_string()),
        job_id: Some("waiting".to_string()),
        user_name: None,
        vc_name: None,
        phase: "Pending".to_string(),
    });
    let services = Services {
        kube,
        ..h.services.clone()
    };

    let scheduling = job("waiting", JobStatus::Scheduling, r#"{"resourcegpu": 1}"#);
    h.store.put_job(scheduling.clone());
    h.launcher
        .set_status("waiting", LaunchStatus::of(LaunchResult::Pending));

    let mut probation = ProbationTracker::new(30);
    refresh_job_status(&services, &mut probation, "/storage", &scheduling)
        .await
        .unwrap();

    let stored = h.store.job("waiting").unwrap();
    assert_eq!(stored.status, JobStatus::Scheduling);
    assert!(detail_text(&stored).contains("pod-0"));
}
