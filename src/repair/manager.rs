//! The per-node repair state machine.
//!
//! Each tick advances every node by at most one transition. A transition is
//! one atomic Kubernetes patch of `{unschedulable, labels, annotations}`;
//! when the patch fails the in-memory node is left untouched and the tick
//! moves on.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use crate::core::{AppResult, JobStatus};
use crate::infra::kube::{KubeApi, NodePatch};
use crate::infra::store::DataStore;
use crate::repair::agent::AgentClient;
use crate::repair::metrics::RepairMetrics;
use crate::repair::node::{parse_for_jobs_and_nodes, RepairJob, WorkerNode};
use crate::repair::rules::{HealthRule, HealthStat, UnschedulableRule};
use crate::repair::state::{
    RepairState, REPAIR_CYCLE, REPAIR_MESSAGE, REPAIR_STATE, REPAIR_STATE_LAST_UPDATE_TIME,
    REPAIR_UNHEALTHY_RULES,
};
use crate::util::clock::now_secs_f64;

/// Seconds of tolerance after a repair attempt during which unhealthy
/// readings do not demote the node back to `OUT_OF_POOL`.
pub const GRACE_PERIOD_SECS: i64 = 5 * 60;

/// Drives the repair cycle of every worker node.
pub struct RepairManager {
    rules: Vec<Arc<dyn HealthRule>>,
    kube: Arc<dyn KubeApi>,
    store: Arc<dyn DataStore>,
    agent: AgentClient,
    metrics: RepairMetrics,
    grace_period: Duration,
    dry_run: bool,
}

impl RepairManager {
    /// Manager over the given collaborators.
    pub fn new(
        rules: Vec<Arc<dyn HealthRule>>,
        kube: Arc<dyn KubeApi>,
        store: Arc<dyn DataStore>,
        agent: AgentClient,
        metrics: RepairMetrics,
        dry_run: bool,
    ) -> Self {
        Self {
            rules,
            kube,
            store,
            agent,
            metrics,
            grace_period: Duration::seconds(GRACE_PERIOD_SECS),
            dry_run,
        }
    }

    /// Override the post-repair grace period, for tests.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// One repair tick: refresh the working set, advance every node by at
    /// most one transition, publish metrics and write per-job repair
    /// messages.
    pub async fn tick(&self) -> AppResult<()> {
        let (mut jobs, mut nodes) = self.get_repair_state().await?;

        tracing::info!(
            "running repair update on {} nodes against rules: {:?}",
            nodes.len(),
            self.rules.iter().map(|rule| rule.name()).collect::<Vec<_>>()
        );
        for node in &mut nodes {
            if self.validate(node).await {
                let before = node.state;
                self.step(node, &mut jobs).await;
                if node.state != before {
                    tracing::info!(
                        "node {} ({}) repair state: {} -> {}, unhealthy rules: {:?}",
                        node.name,
                        node.ip,
                        before.name(),
                        node.state.name(),
                        unhealthy_rules_value(node)
                    );
                }
            } else {
                tracing::error!("validation failed for node {:?}", node);
            }
        }

        self.metrics.publish(&nodes, &jobs, &self.rules);
        self.update_repair_message_for_jobs(&jobs).await;
        self.send_emails(&jobs);
        Ok(())
    }

    /// Refresh jobs from the database, nodes from Kubernetes, and metric
    /// data in every rule.
    async fn get_repair_state(
        &self,
    ) -> AppResult<(BTreeMap<String, RepairJob>, Vec<WorkerNode>)> {
        let active_jobs = self
            .store
            .get_job_list(None, None, &[JobStatus::Scheduling, JobStatus::Running])
            .await?;
        let k8s_nodes = self.kube.list_nodes().await?;
        let k8s_pods = self.kube.list_pods().await?;

        for rule in &self.rules {
            if let Err(e) = rule.update_data().await {
                tracing::error!("rule {} failed to update data: {e}", rule.name());
            }
        }

        Ok(parse_for_jobs_and_nodes(
            &active_jobs,
            &k8s_nodes,
            &k8s_pods,
            &self.rules,
        ))
    }

    /// Correct a node whose label state drifted from its actual
    /// schedulability: a node claiming a repair state while schedulable is
    /// forced back into the pool bookkeeping. Returns false when the
    /// correction patch failed.
    async fn validate(&self, node: &mut WorkerNode) -> bool {
        if node.state != RepairState::InService && !node.unschedulable {
            if node.repair_cycle {
                self.to_out_of_pool(node).await
            } else {
                self.to_out_of_pool_untracked(node).await
            }
        } else {
            true
        }
    }

    /// Advance a node by at most one transition.
    async fn step(&self, node: &mut WorkerNode, jobs: &mut BTreeMap<String, RepairJob>) {
        // Admin escape hatch: any state can be moved to
        // OUT_OF_POOL_UNTRACKED so manual repair can take over any time.
        if node.state != RepairState::OutOfPoolUntracked
            && node.unschedulable
            && !node.repair_cycle
        {
            self.to_out_of_pool_untracked(node).await;
            return;
        }

        match node.state {
            RepairState::InService => {
                if !self.check_health(node, jobs, HealthStat::Cached) {
                    self.to_out_of_pool(node).await;
                }
            }
            RepairState::OutOfPoolUntracked => {
                if !node.unschedulable {
                    self.untracked_to_in_service(node).await;
                } else if node.repair_cycle {
                    self.to_out_of_pool(node).await;
                }
            }
            RepairState::OutOfPool => {
                if self.prepare(node) {
                    self.out_of_pool_to_ready_for_repair(node).await;
                } else {
                    self.refresh_waiting_message(node).await;
                }
            }
            RepairState::ReadyForRepair => {
                if self.send_repair_request(node).await {
                    self.ready_for_repair_to_in_repair(node).await;
                }
            }
            RepairState::InRepair => {
                if self.agent.check_liveness(&node.ip).await {
                    self.in_repair_to_after_repair(node).await;
                }
            }
            RepairState::AfterRepair => {
                let healthy = self.check_health(node, jobs, HealthStat::Current);
                let elapsed = node
                    .last_update_time
                    .map(|last| Duration::seconds((now_secs_f64() - last) as i64));
                if healthy {
                    self.after_repair_to_in_service(node).await;
                } else {
                    match elapsed {
                        // unhealthy within the grace period: hold the state
                        Some(elapsed) if elapsed <= self.grace_period => {}
                        _ => {
                            self.to_out_of_pool(node).await;
                        }
                    }
                }
            }
        }
    }

    /// Evaluate every rule (never short-circuited); the union of failing
    /// rules becomes the node's `unhealthy_rules` and each hosted job is
    /// marked as impacted.
    fn check_health(
        &self,
        node: &mut WorkerNode,
        jobs: &mut BTreeMap<String, RepairJob>,
        stat: HealthStat,
    ) -> bool {
        let failing: Vec<Arc<dyn HealthRule>> = self
            .rules
            .iter()
            .filter(|rule| !rule.check_health(node, stat))
            .cloned()
            .collect();
        node.unhealthy_rules = failing;

        if node.unhealthy_rules.is_empty() {
            return true;
        }
        crate::repair::node::mark_impacted_jobs(node, jobs);
        false
    }

    /// Run `prepare` for every failing rule; all must pass.
    fn prepare(&self, node: &WorkerNode) -> bool {
        node.unhealthy_rules.iter().all(|rule| rule.prepare(node))
    }

    /// Send the failing rule names to the node agent. Nothing to repair
    /// counts as accepted.
    async fn send_repair_request(&self, node: &WorkerNode) -> bool {
        let Some(rule_names) = unhealthy_rules_names(node) else {
            tracing::debug!("nothing in unhealthy_rules for {}", node.name);
            return true;
        };
        self.agent.send_repair_request(&node.ip, &rule_names).await
    }

    /// Apply one atomic patch; in dry-run mode log the intent and report
    /// success so state walks can be rehearsed.
    async fn patch(&self, node: &WorkerNode, patch: &NodePatch) -> bool {
        if self.dry_run {
            tracing::info!(
                "node {} ({}) dry run. current state: {}, patch: {:?}",
                node.name,
                node.ip,
                node.state.name(),
                patch
            );
            return true;
        }
        match self.kube.patch_node(&node.name, patch).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("patch for node {} failed: {e}", node.name);
                false
            }
        }
    }

    async fn to_out_of_pool(&self, node: &mut WorkerNode) -> bool {
        if node.state == RepairState::OutOfPool {
            tracing::warn!(
                "node {} ({}) is already in {}",
                node.name,
                node.ip,
                node.state.name()
            );
            return true;
        }

        // Default to the unschedulable rule, which enforces a reboot at
        // repair, when no failing rule is recorded (e.g. admin cordon that
        // nonetheless entered the repair flow).
        if node.unhealthy_rules.is_empty() {
            node.unhealthy_rules = vec![Arc::new(UnschedulableRule)];
        }
        let message = repair_message(node, "Health event(s) detected, out of scheduling pool", true);
        let patch = NodePatch {
            unschedulable: Some(true),
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::OutOfPool.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_UNHEALTHY_RULES.to_string(), unhealthy_rules_value(node)),
                (REPAIR_CYCLE.to_string(), Some("True".to_string())),
                (REPAIR_MESSAGE.to_string(), Some(message.clone())),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.unschedulable = true;
            node.repair_cycle = true;
            node.repair_message = Some(message);
            node.state = RepairState::OutOfPool;
            true
        } else {
            false
        }
    }

    async fn to_out_of_pool_untracked(&self, node: &mut WorkerNode) -> bool {
        if node.state == RepairState::OutOfPoolUntracked {
            tracing::warn!(
                "node {} ({}) is already in {}",
                node.name,
                node.ip,
                node.state.name()
            );
            return true;
        }

        let message = repair_message(node, "Pending repair by Administrator", false);
        let patch = NodePatch {
            unschedulable: Some(true),
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::OutOfPoolUntracked.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_CYCLE.to_string(), None),
                (REPAIR_MESSAGE.to_string(), Some(message.clone())),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.unschedulable = true;
            node.repair_cycle = false;
            node.repair_message = Some(message);
            node.state = RepairState::OutOfPoolUntracked;
            true
        } else {
            false
        }
    }

    async fn untracked_to_in_service(&self, node: &mut WorkerNode) -> bool {
        let patch = NodePatch {
            unschedulable: Some(false),
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::InService.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_CYCLE.to_string(), None),
                (REPAIR_MESSAGE.to_string(), None),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.unschedulable = false;
            node.repair_cycle = false;
            node.repair_message = None;
            node.state = RepairState::InService;
            true
        } else {
            false
        }
    }

    async fn out_of_pool_to_ready_for_repair(&self, node: &mut WorkerNode) -> bool {
        let message = repair_message(node, "Repair action will start soon", true);
        let patch = NodePatch {
            unschedulable: None,
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::ReadyForRepair.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_MESSAGE.to_string(), Some(message.clone())),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.repair_message = Some(message);
            node.state = RepairState::ReadyForRepair;
            true
        } else {
            false
        }
    }

    /// `OUT_OF_POOL` self-loop while jobs drain; only the message changes.
    async fn refresh_waiting_message(&self, node: &mut WorkerNode) -> bool {
        let message = repair_message(node, "Waiting for job(s) to finish before repair", true);
        if node.repair_message.as_deref() == Some(message.as_str()) {
            return true;
        }
        let patch = NodePatch {
            annotations: [(REPAIR_MESSAGE.to_string(), Some(message.clone()))].into(),
            ..NodePatch::default()
        };
        if self.patch(node, &patch).await {
            node.repair_message = Some(message);
            true
        } else {
            false
        }
    }

    async fn ready_for_repair_to_in_repair(&self, node: &mut WorkerNode) -> bool {
        let message = repair_message(node, "Currently under repair", true);
        let patch = NodePatch {
            unschedulable: None,
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::InRepair.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_MESSAGE.to_string(), Some(message.clone())),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.repair_message = Some(message);
            node.state = RepairState::InRepair;
            true
        } else {
            false
        }
    }

    async fn in_repair_to_after_repair(&self, node: &mut WorkerNode) -> bool {
        let message = repair_message(node, "Repair completed, pending health check", true);
        let patch = NodePatch {
            unschedulable: None,
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::AfterRepair.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_MESSAGE.to_string(), Some(message.clone())),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.repair_message = Some(message);
            node.state = RepairState::AfterRepair;
            node.last_update_time = Some(now_secs_f64());
            true
        } else {
            false
        }
    }

    async fn after_repair_to_in_service(&self, node: &mut WorkerNode) -> bool {
        let patch = NodePatch {
            unschedulable: Some(false),
            labels: [(
                REPAIR_STATE.to_string(),
                Some(RepairState::InService.name().to_string()),
            )]
            .into(),
            annotations: [
                (
                    REPAIR_STATE_LAST_UPDATE_TIME.to_string(),
                    Some(now_secs_f64().to_string()),
                ),
                (REPAIR_UNHEALTHY_RULES.to_string(), None),
                (REPAIR_CYCLE.to_string(), None),
                (REPAIR_MESSAGE.to_string(), None),
            ]
            .into(),
        };
        if self.patch(node, &patch).await {
            node.unschedulable = false;
            node.repair_cycle = false;
            node.repair_message = None;
            node.state = RepairState::InService;
            true
        } else {
            false
        }
    }

    /// Write the repair message of every impacted job back to the
    /// database; an empty object clears it.
    async fn update_repair_message_for_jobs(&self, jobs: &BTreeMap<String, RepairJob>) {
        let timestamp = now_secs_f64().to_string();
        for job in jobs.values() {
            let message = if job.unhealthy_nodes.is_empty() {
                json!({})
            } else {
                let node_msgs: Vec<String> = job
                    .unhealthy_nodes
                    .iter()
                    .map(|(name, info)| format!("{name} ({})", info.desc))
                    .collect();
                let mut msg = format!(
                    "Your job is running on unhealthy node(s): {}. Please check if it is \
                     still running as expected. ",
                    node_msgs.join(", ")
                );
                if job.wait_for_jobs {
                    msg.push_str(
                        "Kill/finish it as soon as possible to expedite node(s) repair.",
                    );
                }
                json!({
                    "timestamp": timestamp,
                    "message": ["FATAL", msg, ""],
                })
            };
            if let Err(e) = self.store.update_repair_message(&job.job_id, &message).await {
                tracing::error!("failed to update repair message for job {}: {e}", job.job_id);
            }
        }
    }

    /// Email hook; alert content is built by
    /// [`crate::infra::email::repair_alert_email`]. Delivery is wired per
    /// deployment.
    fn send_emails(&self, _jobs: &BTreeMap<String, RepairJob>) {}
}

fn unhealthy_rules_names(node: &WorkerNode) -> Option<Vec<String>> {
    if node.unhealthy_rules.is_empty() {
        None
    } else {
        Some(
            node.unhealthy_rules
                .iter()
                .map(|rule| rule.name().to_string())
                .collect(),
        )
    }
}

/// Comma-joined rule names for the annotation, `None` when healthy.
fn unhealthy_rules_value(node: &WorkerNode) -> Option<String> {
    unhealthy_rules_names(node).map(|names| names.join(","))
}

/// Comma-joined rule descriptions for messages, `None` when healthy.
fn unhealthy_rules_desc(node: &WorkerNode) -> Option<String> {
    if node.unhealthy_rules.is_empty() {
        None
    } else {
        Some(
            node.unhealthy_rules
                .iter()
                .map(|rule| rule.desc().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

fn repair_message(node: &WorkerNode, message: &str, attach_rules: bool) -> String {
    if attach_rules {
        match unhealthy_rules_desc(node) {
            Some(desc) => format!("{message} ({desc})"),
            None => message.to_string(),
        }
    } else {
        message.to_string()
    }
}
