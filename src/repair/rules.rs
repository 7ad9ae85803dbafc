//! Pluggable node health rules.
//!
//! A rule is a capability set `{name, desc, update_data, check_health,
//! prepare}`. `update_data` refreshes the rule's metric view once per tick;
//! `check_health` is a cheap predicate over that view; `prepare` gates the
//! transition from `OUT_OF_POOL` to `READY_FOR_REPAIR` (typically waiting
//! for the node's jobs to drain).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::core::ManagerError;
use crate::repair::node::WorkerNode;

/// Which metric snapshot a health check should consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStat {
    /// The snapshot refreshed at the start of the tick.
    Cached,
    /// The freshest data available; used when re-validating after repair.
    Current,
}

/// A pluggable health predicate with lifecycle hooks.
#[async_trait]
pub trait HealthRule: Send + Sync {
    /// Stable rule name, used in annotations and metrics.
    fn name(&self) -> &str;

    /// Human-readable description, surfaced in repair messages.
    fn desc(&self) -> &str;

    /// Whether repair should wait for the node's jobs to finish.
    fn wait_for_jobs(&self) -> bool {
        false
    }

    /// Refresh backing data; called once per repair tick.
    async fn update_data(&self) -> Result<(), ManagerError> {
        Ok(())
    }

    /// True when the node is healthy according to this rule.
    fn check_health(&self, node: &WorkerNode, stat: HealthStat) -> bool;

    /// True when the node is ready to receive the repair request.
    fn prepare(&self, node: &WorkerNode) -> bool {
        let _ = node;
        true
    }
}

/// Source of per-rule unhealthy node sets (a metrics backend in
/// production).
#[async_trait]
pub trait RuleDataSource: Send + Sync {
    /// Names of the nodes currently failing `rule_name`.
    async fn unhealthy_nodes(&self, rule_name: &str) -> Result<HashSet<String>, ManagerError>;
}

/// In-memory rule data source for tests and development.
#[derive(Default)]
pub struct StaticRuleData {
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl StaticRuleData {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the unhealthy node set of a rule.
    pub fn set_unhealthy(&self, rule_name: &str, nodes: impl IntoIterator<Item = String>) {
        self.sets
            .lock()
            .insert(rule_name.to_string(), nodes.into_iter().collect());
    }
}

#[async_trait]
impl RuleDataSource for StaticRuleData {
    async fn unhealthy_nodes(&self, rule_name: &str) -> Result<HashSet<String>, ManagerError> {
        Ok(self.sets.lock().get(rule_name).cloned().unwrap_or_default())
    }
}

/// Default rule: a node that is unschedulable without being inside the
/// repair cycle is unhealthy. Also recorded when a node enters
/// `OUT_OF_POOL` with no failing rule, enforcing a reboot at repair.
pub struct UnschedulableRule;

impl UnschedulableRule {
    /// The stable rule name.
    pub const NAME: &'static str = "UnschedulableRule";
}

#[async_trait]
impl HealthRule for UnschedulableRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn desc(&self) -> &str {
        "node is marked unschedulable"
    }

    fn wait_for_jobs(&self) -> bool {
        true
    }

    fn check_health(&self, node: &WorkerNode, _stat: HealthStat) -> bool {
        !(node.unschedulable && !node.repair_cycle)
    }

    fn prepare(&self, node: &WorkerNode) -> bool {
        node.jobs.is_empty()
    }
}

/// Metric-driven rule flagging nodes with uncorrectable ECC errors.
pub struct EccErrorRule {
    source: Arc<dyn RuleDataSource>,
    unhealthy: RwLock<HashSet<String>>,
}

impl EccErrorRule {
    /// The stable rule name.
    pub const NAME: &'static str = "EccErrorRule";

    /// Rule over the given data source.
    pub fn new(source: Arc<dyn RuleDataSource>) -> Self {
        Self {
            source,
            unhealthy: RwLock::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl HealthRule for EccErrorRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn desc(&self) -> &str {
        "uncorrectable ECC error"
    }

    fn wait_for_jobs(&self) -> bool {
        true
    }

    async fn update_data(&self) -> Result<(), ManagerError> {
        let nodes = self.source.unhealthy_nodes(Self::NAME).await?;
        *self.unhealthy.write() = nodes;
        Ok(())
    }

    fn check_health(&self, node: &WorkerNode, _stat: HealthStat) -> bool {
        !self.unhealthy.read().contains(&node.name)
    }

    fn prepare(&self, node: &WorkerNode) -> bool {
        node.jobs.is_empty()
    }
}

/// Instantiate the configured rules. Unknown names are logged and skipped;
/// an empty configuration yields the default rule set.
pub fn instantiate_rules(
    names: &[String],
    source: Arc<dyn RuleDataSource>,
) -> Vec<Arc<dyn HealthRule>> {
    let mut rules: Vec<Arc<dyn HealthRule>> = Vec::new();
    for name in names {
        match name.as_str() {
            UnschedulableRule::NAME => rules.push(Arc::new(UnschedulableRule)),
            EccErrorRule::NAME => rules.push(Arc::new(EccErrorRule::new(source.clone()))),
            other => tracing::error!("unknown repair rule {other}, skipping"),
        }
    }
    if rules.is_empty() {
        rules.push(Arc::new(UnschedulableRule));
        rules.push(Arc::new(EccErrorRule::new(source)));
    }
    rules
}
