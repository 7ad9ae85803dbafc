//! Worker node and impacted-job views for the repair loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::Job;
use crate::infra::kube::{KubeNode, KubePod};
use crate::repair::rules::HealthRule;
use crate::repair::state::{
    RepairState, REPAIR_CYCLE, REPAIR_MESSAGE, REPAIR_STATE, REPAIR_STATE_LAST_UPDATE_TIME,
    REPAIR_UNHEALTHY_RULES,
};

/// Node label carrying the hardware SKU.
pub const SKU_LABEL: &str = "sku";

/// A worker node as seen by the repair state machine.
#[derive(Clone)]
pub struct WorkerNode {
    /// Node name.
    pub name: String,
    /// Internal IP, target of agent requests.
    pub ip: String,
    /// Hardware SKU from the node labels.
    pub sku: String,
    /// Current repair state, mirroring the `REPAIR_STATE` label.
    pub state: RepairState,
    /// Cordon flag.
    pub unschedulable: bool,
    /// Whether the node is inside the automated repair cycle.
    pub repair_cycle: bool,
    /// Rules currently failing on this node.
    pub unhealthy_rules: Vec<Arc<dyn HealthRule>>,
    /// Ids of the jobs hosted on this node.
    pub jobs: BTreeSet<String>,
    /// UNIX seconds of the last repair state change, from the annotation.
    pub last_update_time: Option<f64>,
    /// Current repair message annotation.
    pub repair_message: Option<String>,
}

impl std::fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerNode")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("sku", &self.sku)
            .field("state", &self.state.name())
            .field("unschedulable", &self.unschedulable)
            .field("repair_cycle", &self.repair_cycle)
            .field(
                "unhealthy_rules",
                &self
                    .unhealthy_rules
                    .iter()
                    .map(|rule| rule.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("jobs", &self.jobs)
            .finish()
    }
}

/// One unhealthy node hosting a job.
#[derive(Debug, Clone, Default)]
pub struct UnhealthyNode {
    /// Node SKU, for impact metrics.
    pub sku: String,
    /// Failing-rule descriptions shown to the user.
    pub desc: String,
}

/// A job the repair loop may impact.
#[derive(Debug, Clone, Default)]
pub struct RepairJob {
    /// Job id.
    pub job_id: String,
    /// Owning user.
    pub user_name: String,
    /// Owning VC.
    pub vc_name: String,
    /// Unhealthy hosting nodes keyed by node name.
    pub unhealthy_nodes: BTreeMap<String, UnhealthyNode>,
    /// Whether repair waits for this job to finish.
    pub wait_for_jobs: bool,
}

/// Mark every job hosted on `node` as impacted by its failing rules.
pub fn mark_impacted_jobs(node: &WorkerNode, jobs: &mut BTreeMap<String, RepairJob>) {
    if node.unhealthy_rules.is_empty() {
        return;
    }
    let desc = node
        .unhealthy_rules
        .iter()
        .map(|rule| rule.desc().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let wait = node.unhealthy_rules.iter().any(|rule| rule.wait_for_jobs());
    for job_id in &node.jobs {
        if let Some(job) = jobs.get_mut(job_id) {
            job.unhealthy_nodes.insert(
                node.name.clone(),
                UnhealthyNode {
                    sku: node.sku.clone(),
                    desc: desc.clone(),
                },
            );
            job.wait_for_jobs = job.wait_for_jobs || wait;
        }
    }
}

fn resolve_rules(
    annotation: Option<&String>,
    rules: &[Arc<dyn HealthRule>],
) -> Vec<Arc<dyn HealthRule>> {
    let Some(value) = annotation else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| {
            let rule = rules.iter().find(|rule| rule.name() == name).cloned();
            if rule.is_none() {
                tracing::warn!("annotation names unknown repair rule {name}, dropping");
            }
            rule
        })
        .collect()
}

/// Build the repair working set from the Kubernetes view and the active
/// jobs. Pods attribute jobs to nodes; a pod whose job is not in the
/// database view still creates an impacted-job entry from its labels.
pub fn parse_for_jobs_and_nodes(
    active_jobs: &[Job],
    k8s_nodes: &[KubeNode],
    k8s_pods: &[KubePod],
    rules: &[Arc<dyn HealthRule>],
) -> (BTreeMap<String, RepairJob>, Vec<WorkerNode>) {
    let mut jobs: BTreeMap<String, RepairJob> = active_jobs
        .iter()
        .map(|job| {
            (
                job.job_id.clone(),
                RepairJob {
                    job_id: job.job_id.clone(),
                    user_name: job.user_name.clone(),
                    vc_name: job.vc_name.clone(),
                    ..RepairJob::default()
                },
            )
        })
        .collect();

    let mut jobs_by_node: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for pod in k8s_pods {
        let (Some(node_name), Some(job_id)) = (&pod.node_name, &pod.job_id) else {
            continue;
        };
        jobs_by_node
            .entry(node_name.clone())
            .or_default()
            .insert(job_id.clone());
        jobs.entry(job_id.clone()).or_insert_with(|| RepairJob {
            job_id: job_id.clone(),
            user_name: pod.user_name.clone().unwrap_or_default(),
            vc_name: pod.vc_name.clone().unwrap_or_default(),
            ..RepairJob::default()
        });
    }

    let nodes: Vec<WorkerNode> = k8s_nodes
        .iter()
        .map(|node| {
            let state = node
                .labels
                .get(REPAIR_STATE)
                .and_then(|value| {
                    let parsed = RepairState::parse(value);
                    if parsed.is_none() {
                        tracing::warn!(
                            "node {} has unrecognized {REPAIR_STATE} label {value}",
                            node.name
                        );
                    }
                    parsed
                })
                .unwrap_or(RepairState::InService);
            WorkerNode {
                name: node.name.clone(),
                ip: node.ip.clone(),
                sku: node.labels.get(SKU_LABEL).cloned().unwrap_or_default(),
                state,
                unschedulable: node.unschedulable,
                repair_cycle: node.annotations.get(REPAIR_CYCLE).map(String::as_str)
                    == Some("True"),
                unhealthy_rules: resolve_rules(
                    node.annotations.get(REPAIR_UNHEALTHY_RULES),
                    rules,
                ),
                jobs: jobs_by_node.remove(&node.name).unwrap_or_default(),
                last_update_time: node
                    .annotations
                    .get(REPAIR_STATE_LAST_UPDATE_TIME)
                    .and_then(|value| value.parse().ok()),
                repair_message: node.annotations.get(REPAIR_MESSAGE).cloned(),
            }
        })
        .collect();

    // nodes already mid-cycle carry their failing rules in the annotation;
    // their hosted jobs count as impacted without a fresh health pass
    for node in &nodes {
        mark_impacted_jobs(node, &mut jobs);
    }

    (jobs, nodes)
}
