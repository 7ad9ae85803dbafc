//! Node repair: state machine, health rules, agent client and metrics.

pub mod agent;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod rules;
pub mod state;

pub use agent::AgentClient;
pub use manager::{RepairManager, GRACE_PERIOD_SECS};
pub use metrics::RepairMetrics;
pub use node::{
    mark_impacted_jobs, parse_for_jobs_and_nodes, RepairJob, UnhealthyNode, WorkerNode, SKU_LABEL,
};
pub use rules::{
    instantiate_rules, EccErrorRule, HealthRule, HealthStat, RuleDataSource, StaticRuleData,
    UnschedulableRule,
};
pub use state::{
    RepairState, ALL_STATES, REPAIR_CYCLE, REPAIR_MESSAGE, REPAIR_STATE,
    REPAIR_STATE_LAST_UPDATE_TIME, REPAIR_UNHEALTHY_RULES,
};
