//! Launcher backend seam.
//!
//! The launcher is what actually creates and destroys workloads. Two
//! implementations exist: an in-process launcher that owns workload
//! bookkeeping itself, and a stub that only updates database rows and lets
//! an external controller do the work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::core::{encode_detail, message_detail, Job, JobStatus, ManagerError};
use crate::infra::kube::KubeApi;
use crate::infra::store::{DataStore, JobFields};

/// Workload status as reported by the launcher backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchResult {
    /// Workload completed successfully.
    Succeeded,
    /// Workload is running.
    Running,
    /// Workload failed.
    Failed,
    /// Workload accepted but not yet running.
    Pending,
    /// Backend cannot tell (e.g. node lost).
    Unknown,
    /// Backend has no trace of the workload.
    NotFound,
}

impl LaunchResult {
    /// User-facing word for this result.
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchResult::Succeeded => "Succeeded",
            LaunchResult::Running => "Running",
            LaunchResult::Failed => "Failed",
            LaunchResult::Pending => "Pending",
            LaunchResult::Unknown => "Unknown",
            LaunchResult::NotFound => "NotFound",
        }
    }
}

/// Full status report for a workload.
#[derive(Debug, Clone)]
pub struct LaunchStatus {
    /// Coarse result.
    pub result: LaunchResult,
    /// Backend-specific detail payload.
    pub detail: serde_json::Value,
    /// Failure diagnostics, empty unless failed.
    pub diagnostics: String,
}

impl LaunchStatus {
    /// Status with no detail or diagnostics.
    pub fn of(result: LaunchResult) -> Self {
        Self {
            result,
            detail: serde_json::Value::Null,
            diagnostics: String::new(),
        }
    }
}

/// Capability set of a launcher backend.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// One-time startup hook.
    async fn start(&self);

    /// Launch a job's workload; moves the job to `scheduling`.
    async fn submit_job(&self, job: &Job) -> Result<(), ManagerError>;

    /// Tear down a job's workload and move it to `final_status`. When
    /// `update_queue_time` is false the job keeps its `lastUpdated` so a
    /// preempted job does not lose its queue position.
    async fn kill_job(
        &self,
        job_id: &str,
        final_status: JobStatus,
        update_queue_time: bool,
    ) -> Result<(), ManagerError>;

    /// Delete launcher-side resources of a finished workload.
    async fn delete_job(&self, job_id: &str, force: bool) -> Result<(), ManagerError>;

    /// Resize an inference workload to its current `resourcegpu`.
    async fn scale_job(&self, job: &Job) -> Result<(), ManagerError>;

    /// Report workload status.
    async fn get_job_status(&self, job_id: &str) -> Result<LaunchStatus, ManagerError>;

    /// Wait for workload mutations issued in the previous tick to settle.
    async fn wait_tasks_done(&self);
}

async fn mark_submitted(store: &dyn DataStore, job: &Job) -> Result<(), ManagerError> {
    let fields = JobFields {
        status: Some(JobStatus::Scheduling),
        status_detail_blob: Some(encode_detail(&message_detail("launching the workload."))?),
        last_updated: Some(Utc::now()),
        ..JobFields::default()
    };
    store.update_job_text_fields(&job.job_id, &fields).await
}

async fn mark_killed(
    store: &dyn DataStore,
    job_id: &str,
    final_status: JobStatus,
    update_queue_time: bool,
) -> Result<(), ManagerError> {
    let fields = JobFields {
        status: Some(final_status),
        last_updated: update_queue_time.then(Utc::now),
        ..JobFields::default()
    };
    store.update_job_text_fields(job_id, &fields).await
}

/// In-process launcher: owns workload state directly.
pub struct InProcessLauncher {
    store: Arc<dyn DataStore>,
    states: Mutex<HashMap<String, LaunchStatus>>,
}

impl InProcessLauncher {
    /// Launcher over the given store.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Force the reported status of a workload. Drives tests and lets
    /// operators simulate backend conditions.
    pub fn set_status(&self, job_id: impl Into<String>, status: LaunchStatus) {
        self.states.lock().insert(job_id.into(), status);
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn start(&self) {
        tracing::info!("in-process launcher started");
    }

    async fn submit_job(&self, job: &Job) -> Result<(), ManagerError> {
        mark_submitted(self.store.as_ref(), job).await?;
        self.states
            .lock()
            .insert(job.job_id.clone(), LaunchStatus::of(LaunchResult::Pending));
        tracing::info!("submitted workload for job {}", job.job_id);
        Ok(())
    }

    async fn kill_job(
        &self,
        job_id: &str,
        final_status: JobStatus,
        update_queue_time: bool,
    ) -> Result<(), ManagerError> {
        self.states.lock().remove(job_id);
        mark_killed(self.store.as_ref(), job_id, final_status, update_queue_time).await
    }

    async fn delete_job(&self, job_id: &str, force: bool) -> Result<(), ManagerError> {
        self.states.lock().remove(job_id);
        tracing::debug!("deleted workload of job {job_id} (force: {force})");
        Ok(())
    }

    async fn scale_job(&self, job: &Job) -> Result<(), ManagerError> {
        let gpus = job.params()?.resourcegpu;
        tracing::info!("scaled workload of job {} to {gpus} gpus", job.job_id);
        Ok(())
    }

    async fn get_job_status(&self, job_id: &str) -> Result<LaunchStatus, ManagerError> {
        Ok(self
            .states
            .lock()
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| LaunchStatus::of(LaunchResult::NotFound)))
    }

    async fn wait_tasks_done(&self) {}
}

/// Stub launcher delegating to an external controller: mutations are row
/// updates the controller acts upon; status is derived from pod phases.
pub struct ControllerLauncherStub {
    store: Arc<dyn DataStore>,
    kube: Arc<dyn KubeApi>,
}

impl ControllerLauncherStub {
    /// Stub over the given store and API server.
    pub fn new(store: Arc<dyn DataStore>, kube: Arc<dyn KubeApi>) -> Self {
        Self { store, kube }
    }
}

#[async_trait]
impl Launcher for ControllerLauncherStub {
    async fn start(&self) {
        tracing::info!("controller launcher stub started");
    }

    async fn submit_job(&self, job: &Job) -> Result<(), ManagerError> {
        mark_submitted(self.store.as_ref(), job).await
    }

    async fn kill_job(
        &self,
        job_id: &str,
        final_status: JobStatus,
        update_queue_time: bool,
    ) -> Result<(), ManagerError> {
        mark_killed(self.store.as_ref(), job_id, final_status, update_queue_time).await
    }

    async fn delete_job(&self, _job_id: &str, _force: bool) -> Result<(), ManagerError> {
        // The controller garbage-collects terminal workloads on its own.
        Ok(())
    }

    async fn scale_job(&self, _job: &Job) -> Result<(), ManagerError> {
        // The controller reacts to the rewritten resourcegpu in jobParams.
        Ok(())
    }

    async fn get_job_status(&self, job_id: &str) -> Result<LaunchStatus, ManagerError> {
        let pods = self.kube.list_pods().await?;
        let phases: Vec<&str> = pods
            .iter()
            .filter(|pod| pod.job_id.as_deref() == Some(job_id))
            .map(|pod| pod.phase.as_str())
            .collect();
        let result = if phases.is_empty() {
            LaunchResult::NotFound
        } else if phases.iter().any(|p| *p == "Failed") {
            LaunchResult::Failed
        } else if phases.iter().all(|p| *p == "Succeeded") {
            LaunchResult::Succeeded
        } else if phases.iter().any(|p| *p == "Running") {
            LaunchResult::Running
        } else if phases.iter().any(|p| *p == "Unknown") {
            LaunchResult::Unknown
        } else {
            LaunchResult::Pending
        };
        Ok(LaunchStatus::of(result))
    }

    async fn wait_tasks_done(&self) {}
}
