//! Prometheus gauges published by the repair loop.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use prometheus::{IntGaugeVec, Opts, Registry};

use crate::core::ManagerError;
use crate::repair::node::{RepairJob, WorkerNode};
use crate::repair::rules::HealthRule;
use crate::repair::state::ALL_STATES;

/// Owner of the repair gauge families. Gauges are zero-filled across the
/// full state x SKU and rule x SKU grids every tick so absent combinations
/// read as zero rather than staying stale.
pub struct RepairMetrics {
    state_gauge: IntGaugeVec,
    rule_gauge: IntGaugeVec,
    impacted_jobs: IntGaugeVec,
}

impl RepairMetrics {
    /// Create and register the gauge families.
    pub fn new(registry: &Registry) -> Result<Self, ManagerError> {
        let config = |name: &str, help: &str, labels: &[&str]| {
            IntGaugeVec::new(Opts::new(name, help), labels)
                .map_err(|e| ManagerError::Config(e.to_string()))
        };
        let state_gauge = config(
            "repair_state_node_count",
            "node count in different repair states",
            &["repair_state", "sku"],
        )?;
        let rule_gauge = config(
            "repair_rule_node_count",
            "node count in different repair rules",
            &["repair_rule", "sku"],
        )?;
        let impacted_jobs = config(
            "repair_impacted_job_count",
            "Number of jobs impacted by repair",
            &["sku"],
        )?;
        for gauge in [&state_gauge, &rule_gauge, &impacted_jobs] {
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| ManagerError::Config(e.to_string()))?;
        }
        Ok(Self {
            state_gauge,
            rule_gauge,
            impacted_jobs,
        })
    }

    /// Publish this tick's node and job counts.
    pub fn publish(
        &self,
        nodes: &[WorkerNode],
        jobs: &BTreeMap<String, RepairJob>,
        rules: &[Arc<dyn HealthRule>],
    ) {
        let skus: BTreeSet<&str> = nodes.iter().map(|node| node.sku.as_str()).collect();

        self.state_gauge.reset();
        for state in ALL_STATES {
            for sku in &skus {
                self.state_gauge.with_label_values(&[state.name(), sku]).set(0);
            }
        }
        for node in nodes {
            self.state_gauge
                .with_label_values(&[node.state.name(), &node.sku])
                .inc();
        }

        self.rule_gauge.reset();
        for rule in rules {
            for sku in &skus {
                self.rule_gauge.with_label_values(&[rule.name(), sku]).set(0);
            }
        }
        for node in nodes {
            for rule in &node.unhealthy_rules {
                self.rule_gauge
                    .with_label_values(&[rule.name(), &node.sku])
                    .inc();
            }
        }

        self.impacted_jobs.reset();
        for sku in &skus {
            self.impacted_jobs.with_label_values(&[sku]).set(0);
        }
        for job in jobs.values() {
            for node in job.unhealthy_nodes.values() {
                self.impacted_jobs.with_label_values(&[&node.sku]).inc();
            }
        }
    }

    /// Current value of the state gauge, for tests.
    pub fn state_count(&self, state: &str, sku: &str) -> i64 {
        self.state_gauge.with_label_values(&[state, sku]).get()
    }

    /// Current value of the impact gauge, for tests.
    pub fn impacted_count(&self, sku: &str) -> i64 {
        self.impacted_jobs.with_label_values(&[sku]).get()
    }
}
