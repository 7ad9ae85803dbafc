//! Multi-tier job scheduler: capacity derivation, admission passes,
//! approval, lifecycle refresh and the latency probe.

pub mod actions;
pub mod approval;
pub mod capacity;
pub mod latency;
pub mod lifecycle;
pub mod passes;
pub mod working_set;

use std::sync::Arc;

use crate::infra::kube::KubeApi;
use crate::infra::launcher::Launcher;
use crate::infra::logs::JobLogExtractor;
use crate::infra::notify::Notifier;
use crate::infra::store::DataStore;
use crate::infra::timing::TimingStore;
use crate::scheduler::latency::StateLatency;

pub use actions::take_job_actions;
pub use approval::approve_job;
pub use capacity::{cluster_schedulable, vc_schedulables, SYSTEM_RESERVE_DISCOUNT};
pub use latency::{update_job_state_latency, JobState, JobTimeRecord};
pub use lifecycle::{refresh_job_status, ProbationTracker};
pub use working_set::{build_working_set, JobEntry, SortKey, DEFAULT_PRIORITY};

/// Long-lived collaborators threaded through every scheduler operation.
#[derive(Clone)]
pub struct Services {
    /// Source of truth for jobs, VCs and cluster status.
    pub store: Arc<dyn DataStore>,
    /// Workload backend.
    pub launcher: Arc<dyn Launcher>,
    /// Kubernetes view, for pending-pod detail.
    pub kube: Arc<dyn KubeApi>,
    /// Coordination store holding latency records.
    pub timing: Arc<dyn TimingStore>,
    /// State-change latency histogram.
    pub latency: StateLatency,
    /// Outbound user notifications.
    pub notifier: Notifier,
    /// Log-extraction trigger.
    pub logs: Arc<dyn JobLogExtractor>,
}
