//! Admission pass behavior over a synthetic cluster snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use prometheus_cluster_manager::core::{
    ClusterResource, Job, JobStatus, ResourceAxis, SchedulingPolicy,
};
use prometheus_cluster_manager::infra::kube::InMemoryKube;
use prometheus_cluster_manager::infra::launcher::InProcessLauncher;
use prometheus_cluster_manager::infra::logs::NullLogExtractor;
use prometheus_cluster_manager::infra::notify::{CollectingSink, Notifier};
use prometheus_cluster_manager::infra::store::{
    ClusterStatusRecord, DataStore, InMemoryStore, VcResourceStatus,
};
use prometheus_cluster_manager::infra::timing::InMemoryTimingStore;
use prometheus_cluster_manager::scheduler::latency::StateLatency;
use prometheus_cluster_manager::scheduler::passes::{
    mark_inference_guaranteed, mark_inference_preemptable, mark_nonpreemptable_training,
    mark_preemptable_training,
};
use prometheus_cluster_manager::scheduler::working_set::build_working_set;
use prometheus_cluster_manager::scheduler::{take_job_actions, Services};
use prometheus_cluster_manager::util::encoding::{b64decode, b64encode};

fn resource(cpu: f64, memory: f64, gpu: f64) -> ClusterResource {
    ClusterResource::from_axes(
        ResourceAxis::from_pairs([("A100", cpu)]),
        ResourceAxis::from_pairs([("A100", memory)]),
        ResourceAxis::from_pairs([("A100", gpu)]),
    )
}

fn job(id: &str, status: JobStatus, params_json: &str, queue_time: i64) -> Job {
    Job {
        job_id: id.to_string(),
        user_name: "alice".to_string(),
        vc_name: "v1".to_string(),
        status,
        params_blob: b64encode(params_json),
        job_time: Utc.timestamp_opt(queue_time, 0).unwrap(),
        last_updated: Utc.timestamp_opt(queue_time, 0).unwrap(),
        error_msg: String::new(),
        status_detail_blob: None,
    }
}

fn training_params(gpus: u32) -> String {
    format!(r#"{{"resourcegpu": {gpus}, "gpuType": "A100", "cpurequest": 1, "memoryrequest": 1}}"#)
}

#[test]
fn fifo_head_of_line_blocking() {
    let jobs = vec![
        job("J1", JobStatus::Queued, &training_params(8), 100),
        job("J2", JobStatus::Queued, &training_params(2), 200),
    ];
    let priorities = HashMap::from([("J1".to_string(), 200_i64), ("J2".to_string(), 100_i64)]);
    let mut cluster = resource(100.0, 100.0, 4.0);
    let mut vcs = HashMap::from([("v1".to_string(), resource(100.0, 100.0, 4.0))]);
    let policies = HashMap::from([("v1".to_string(), SchedulingPolicy::Fifo)]);

    let mut entries = build_working_set(&jobs, &priorities, &mut cluster, &mut vcs);
    assert_eq!(entries[0].job.job_id, "J1"); // higher priority sorts first

    mark_nonpreemptable_training(&mut entries, &mut cluster, &mut vcs, &policies);

    let j1 = entries.iter().find(|e| e.job.job_id == "J1").unwrap();
    let j2 = entries.iter().find(|e| e.job.job_id == "J2").unwrap();
    assert!(!j1.allowed);
    assert!(j1.reason.as_deref().unwrap().starts_with("resource not enough"));
    assert!(!j2.allowed);
    let j2_reason = j2.reason.as_deref().unwrap();
    assert!(j2_reason.contains("blocked by"));
    assert!(j2_reason.contains("J1"));
    // the fat head job admitted nothing, so nothing was deducted
    assert!((vcs["v1"].gpu.get("A100") - 4.0).abs() < 1e-9);
}

#[test]
fn runnable_first_lets_smaller_jobs_through() {
    let jobs = vec![
        job("J1", JobStatus::Queued, &training_params(8), 100),
        job("J2", JobStatus::Queued, &training_params(2), 200),
    ];
    let priorities = HashMap::from([("J1".to_string(), 200_i64)]);
    let mut cluster = resource(100.0, 100.0, 4.0);
    let mut vcs = HashMap::from([("v1".to_string(), resource(100.0, 100.0, 4.0))]);
    let policies = HashMap::from([("v1".to_string(), SchedulingPolicy::RunnableFirst)]);

    let mut entries = build_working_set(&jobs, &priorities, &mut cluster, &mut vcs);
    mark_nonpreemptable_training(&mut entries, &mut cluster, &mut vcs, &policies);

    let j1 = entries.iter().find(|e| e.job.job_id == "J1").unwrap();
    let j2 = entries.iter().find(|e| e.job.job_id == "J2").unwrap();
    assert!(!j1.allowed);
    assert!(j2.allowed);
    assert!((vcs["v1"].gpu.get("A100") - 2.0).abs() < 1e-9);
}

#[test]
fn exact_fit_is_admitted_one_unit_more_is_not() {
    for (gpus, expect_allowed) in [(4, true), (5, false)] {
        let jobs = vec![job("J", JobStatus::Queued, &training_params(gpus), 100)];
        let mut cluster = resource(100.0, 100.0, 4.0);
        let mut vcs = HashMap::from([("v1".to_string(), resource(100.0, 100.0, 4.0))]);
        let mut entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);
        mark_nonpreemptable_training(&mut entries, &mut cluster, &mut vcs, &HashMap::new());
        assert_eq!(entries[0].allowed, expect_allowed, "{gpus} gpus");
    }
}

#[test]
fn preemptable_training_takes_global_bonus_only() {
    // vc has no headroom left, but the cluster does: the preemptable job
    // still gets in, deducting from the cluster alone
    let jobs = vec![job(
        "P",
        JobStatus::Queued,
        r#"{"resourcegpu": 2, "gpuType": "A100", "cpurequest": 1, "memoryrequest": 1,
            "preemptionAllowed": true}"#,
        100,
    )];
    let mut cluster = resource(100.0, 100.0, 4.0);
    let mut vcs = HashMap::from([("v1".to_string(), resource(100.0, 100.0, 0.0))]);
    let mut entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);

    mark_preemptable_training(&mut entries, &mut cluster);

    assert!(entries[0].allowed);
    assert!((cluster.gpu.get("A100") - 2.0).abs() < 1e-9);
    assert!((vcs["v1"].gpu.get("A100") - 0.0).abs() < 1e-9);
}

#[test]
fn inference_fractional_allocation() {
    let jobs = vec![job(
        "I",
        JobStatus::Queued,
        r#"{"resourcegpu": 2, "gpuType": "A100", "cpurequest": 40, "memoryrequest": 80,
            "jobtrainingtype": "InferenceJob",
            "preemptable_resource": {"cpu": {"A100": 40}, "memory": {"A100": 80},
                                     "gpu": {"A100": 4}}}"#,
        100,
    )];
    let mut cluster = resource(1000.0, 1000.0, 3.0);
    let mut vcs = HashMap::from([("v1".to_string(), resource(1000.0, 1000.0, 3.0))]);
    let mut entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);

    mark_inference_guaranteed(&mut entries, &mut cluster, &mut vcs);
    assert!(entries[0].allowed);
    assert!((cluster.gpu.get("A100") - 1.0).abs() < 1e-9); // 1 GPU left

    let cpu_before = cluster.cpu.get("A100");
    let memory_before = cluster.memory.get("A100");
    mark_inference_preemptable(&mut entries, &mut cluster);

    let allowed = entries[0].allowed_resource.as_ref().unwrap();
    assert!((allowed.gpu.get("A100") - 3.0).abs() < 1e-9);
    assert!((allowed.cpu.get("A100") - 50.0).abs() < 1e-9);
    assert!((allowed.memory.get("A100") - 100.0).abs() < 1e-9);
    // the cluster lost exactly the fractional portion
    assert!((cluster.gpu.get("A100") - 0.0).abs() < 1e-9);
    assert!((cpu_before - cluster.cpu.get("A100") - 10.0).abs() < 1e-9);
    assert!((memory_before - cluster.memory.get("A100") - 20.0).abs() < 1e-9);
}

#[test]
fn degenerate_fractional_allocation_keeps_guaranteed_portion() {
    let jobs = vec![job(
        "I",
        JobStatus::Queued,
        r#"{"resourcegpu": 1, "gpuType": "A100", "cpurequest": 10, "memoryrequest": 10,
            "jobtrainingtype": "InferenceJob",
            "preemptable_resource": {"cpu": {"A100": 10}, "memory": {"A100": 10},
                                     "gpu": {"A100": 2}}}"#,
        100,
    )];
    // exactly one GPU: the guaranteed portion consumes it all
    let mut cluster = resource(1000.0, 1000.0, 1.0);
    let mut vcs = HashMap::from([("v1".to_string(), resource(1000.0, 1000.0, 1.0))]);
    let mut entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);

    mark_inference_guaranteed(&mut entries, &mut cluster, &mut vcs);
    mark_inference_preemptable(&mut entries, &mut cluster);

    // the elastic portion degenerated to zero GPUs and was denied, but the
    // guaranteed portion stays admitted at its previous size
    let entry = &entries[0];
    assert!(entry.allowed);
    let allowed = entry.allowed_resource.as_ref().unwrap();
    assert!((allowed.gpu.get("A100") - 1.0).abs() < 1e-9);
}

#[test]
fn schedulables_never_go_negative() {
    let jobs = vec![
        job("A", JobStatus::Queued, &training_params(3), 100),
        job("B", JobStatus::Queued, &training_params(3), 200),
        job(
            "P",
            JobStatus::Queued,
            r#"{"resourcegpu": 3, "gpuType": "A100", "cpurequest": 1, "memoryrequest": 1,
                "preemptionAllowed": true}"#,
            300,
        ),
    ];
    let mut cluster = resource(10.0, 10.0, 4.0);
    let mut vcs = HashMap::from([("v1".to_string(), resource(10.0, 10.0, 4.0))]);
    let mut entries = build_working_set(&jobs, &HashMap::new(), &mut cluster, &mut vcs);

    mark_nonpreemptable_training(&mut entries, &mut cluster, &mut vcs, &HashMap::new());
    mark_preemptable_training(&mut entries, &mut cluster);

    for (sku, amount) in cluster.gpu.iter() {
        assert!(amount >= 0.0, "cluster gpu {sku} went negative");
    }
    for (_, vc) in &vcs {
        for (sku, amount) in vc.gpu.iter() {
            assert!(amount >= 0.0, "vc gpu {sku} went negative");
        }
    }
}

fn services_over(store: Arc<InMemoryStore>) -> Services {
    Services {
        store: store.clone(),
        launcher: Arc::new(InProcessLauncher::new(store)),
        kube: Arc::new(InMemoryKube::new()),
        timing: Arc::new(InMemoryTimingStore::new()),
        latency: StateLatency::unregistered(),
        notifier: Notifier::spawn(Arc::new(CollectingSink::new())),
        logs: Arc::new(NullLogExtractor),
    }
}

fn cluster_record(gpus: f64) -> ClusterStatusRecord {
    ClusterStatusRecord {
        capacity: resource(1000.0, 1000.0, gpus),
        reserved: ClusterResource::default(),
        vc_statuses: [(
            "v1".to_string(),
            VcResourceStatus {
                capacity: resource(1000.0, 1000.0, gpus),
                unschedulable: ClusterResource::default(),
            },
        )]
        .into_iter()
        .collect(),
    }
}

#[tokio::test]
async fn full_pass_submits_and_explains() {
    let store = Arc::new(InMemoryStore::new());
    store.put_cluster_status(cluster_record(4.0));
    store.put_vc(prometheus_cluster_manager::core::VirtualCluster {
        vc_name: "v1".to_string(),
        metadata: "{}".to_string(),
    });
    store.put_job(job("fits", JobStatus::Queued, &training_params(4), 100));
    store.put_job(job("starved", JobStatus::Queued, &training_params(2), 200));

    let services = services_over(store.clone());
    let jobs = store
        .get_job_list(None, None, &[JobStatus::Queued])
        .await
        .unwrap();
    take_job_actions(&services, &jobs).await.unwrap();

    assert_eq!(store.job("fits").unwrap().status, JobStatus::Scheduling);

    let starved = store.job("starved").unwrap();
    assert_eq!(starved.status, JobStatus::Queued);
    let detail = b64decode(&starved.status_detail_blob.unwrap()).unwrap();
    assert!(detail.contains("Waiting for resource"));
}

#[tokio::test]
async fn preemptable_job_is_returned_to_queue_when_capacity_drops() {
    let store = Arc::new(InMemoryStore::new());
    store.put_cluster_status(cluster_record(1.0));
    store.put_vc(prometheus_cluster_manager::core::VirtualCluster {
        vc_name: "v1".to_string(),
        metadata: "{}".to_string(),
    });
    let running = job(
        "bonus",
        JobStatus::Running,
        r#"{"resourcegpu": 2, "gpuType": "A100", "cpurequest": 1, "memoryrequest": 1,
            "preemptionAllowed": true}"#,
        100,
    );
    let queue_time = running.last_updated;
    store.put_job(running);

    let services = services_over(store.clone());
    let jobs = store
        .get_job_list(None, None, &[JobStatus::Running])
        .await
        .unwrap();
    take_job_actions(&services, &jobs).await.unwrap();

    let requeued = store.job("bonus").unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    // the queue position is preserved on preemption
    assert_eq!(requeued.last_updated, queue_time);
}
