//! Persistence layer seam.
//!
//! The relational database is the source of truth for job and VC state; the
//! control loops only consume the narrow surface below. An in-memory
//! implementation backs tests and development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{ClusterResource, Job, JobStatus, ManagerError, VirtualCluster};

/// Per-VC slice of the cluster status singleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcResourceStatus {
    /// Capacity assigned to the VC.
    pub capacity: ClusterResource,
    /// Portion currently unschedulable (cordoned or reserved nodes).
    pub unschedulable: ClusterResource,
}

/// The `ClusterStatus` singleton record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStatusRecord {
    /// Total cluster capacity per axis and SKU.
    pub capacity: ClusterResource,
    /// Reserved portion (system overhead, unschedulable nodes).
    pub reserved: ClusterResource,
    /// Per-VC slices keyed by VC name.
    pub vc_statuses: HashMap<String, VcResourceStatus>,
}

/// A job endpoint row (ssh, tensorboard, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEndpoint {
    /// Endpoint identifier.
    pub endpoint_id: String,
    /// Owning job.
    pub job_id: String,
    /// Endpoint status, reset to `pending` before a resubmit.
    pub status: String,
}

/// Field set for the conditional `UPDATE ... WHERE jobId = ?`. Only present
/// fields are written.
#[derive(Debug, Clone, Default)]
pub struct JobFields {
    /// New lifecycle status.
    pub status: Option<JobStatus>,
    /// New base64 detail blob.
    pub status_detail_blob: Option<String>,
    /// New last-updated instant.
    pub last_updated: Option<DateTime<Utc>>,
    /// New error message.
    pub error_msg: Option<String>,
    /// New base64 parameter blob (inference scaling write-back).
    pub params_blob: Option<String>,
}

/// Narrow view over the relational database consumed by both managers.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Jobs filtered by owner, VC and status set; `None` matches all.
    async fn get_job_list(
        &self,
        user: Option<&str>,
        vc: Option<&str>,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, ManagerError>;

    /// The cluster status singleton.
    async fn get_cluster_status(&self) -> Result<ClusterStatusRecord, ManagerError>;

    /// All virtual clusters.
    async fn list_vcs(&self) -> Result<Vec<VirtualCluster>, ManagerError>;

    /// Per-job priority overrides; absent jobs use the default priority.
    async fn get_job_priorities(&self) -> Result<HashMap<String, i64>, ManagerError>;

    /// Endpoints of a job.
    async fn get_job_endpoints(&self, job_id: &str) -> Result<Vec<JobEndpoint>, ManagerError>;

    /// Persist an endpoint mutation.
    async fn update_endpoint(&self, endpoint: &JobEndpoint) -> Result<(), ManagerError>;

    /// Conditional update of job text fields keyed by job id.
    async fn update_job_text_fields(
        &self,
        job_id: &str,
        fields: &JobFields,
    ) -> Result<(), ManagerError>;

    /// Write (or clear, with an empty object) the repair message of a job.
    async fn update_repair_message(
        &self,
        job_id: &str,
        message: &serde_json::Value,
    ) -> Result<(), ManagerError>;
}

#[derive(Default)]
struct StoreInner {
    jobs: BTreeMap<String, Job>,
    cluster_status: ClusterStatusRecord,
    vcs: Vec<VirtualCluster>,
    priorities: HashMap<String, i64>,
    endpoints: BTreeMap<String, Vec<JobEndpoint>>,
    repair_messages: BTreeMap<String, serde_json::Value>,
}

/// In-memory store for tests and development.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job row.
    pub fn put_job(&self, job: Job) {
        self.inner.lock().jobs.insert(job.job_id.clone(), job);
    }

    /// Replace the cluster status singleton.
    pub fn put_cluster_status(&self, status: ClusterStatusRecord) {
        self.inner.lock().cluster_status = status;
    }

    /// Insert a VC row.
    pub fn put_vc(&self, vc: VirtualCluster) {
        self.inner.lock().vcs.push(vc);
    }

    /// Set a job priority override.
    pub fn put_priority(&self, job_id: impl Into<String>, priority: i64) {
        self.inner.lock().priorities.insert(job_id.into(), priority);
    }

    /// Insert an endpoint row.
    pub fn put_endpoint(&self, endpoint: JobEndpoint) {
        self.inner
            .lock()
            .endpoints
            .entry(endpoint.job_id.clone())
            .or_default()
            .push(endpoint);
    }

    /// Current state of a job row.
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    /// Last repair message written for a job.
    pub fn repair_message(&self, job_id: &str) -> Option<serde_json::Value> {
        self.inner.lock().repair_messages.get(job_id).cloned()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn get_job_list(
        &self,
        user: Option<&str>,
        vc: Option<&str>,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, ManagerError> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| user.map_or(true, |u| job.user_name == u))
            .filter(|job| vc.map_or(true, |v| job.vc_name == v))
            .filter(|job| statuses.is_empty() || statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.job_time.cmp(&b.job_time));
        Ok(jobs)
    }

    async fn get_cluster_status(&self) -> Result<ClusterStatusRecord, ManagerError> {
        Ok(self.inner.lock().cluster_status.clone())
    }

    async fn list_vcs(&self) -> Result<Vec<VirtualCluster>, ManagerError> {
        Ok(self.inner.lock().vcs.clone())
    }

    async fn get_job_priorities(&self) -> Result<HashMap<String, i64>, ManagerError> {
        Ok(self.inner.lock().priorities.clone())
    }

    async fn get_job_endpoints(&self, job_id: &str) -> Result<Vec<JobEndpoint>, ManagerError> {
        Ok(self
            .inner
            .lock()
            .endpoints
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_endpoint(&self, endpoint: &JobEndpoint) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock();
        let endpoints = inner.endpoints.entry(endpoint.job_id.clone()).or_default();
        match endpoints
            .iter_mut()
            .find(|e| e.endpoint_id == endpoint.endpoint_id)
        {
            Some(existing) => *existing = endpoint.clone(),
            None => endpoints.push(endpoint.clone()),
        }
        Ok(())
    }

    async fn update_job_text_fields(
        &self,
        job_id: &str,
        fields: &JobFields,
    ) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ManagerError::Store(format!("no such job {job_id}")))?;
        if let Some(status) = fields.status {
            job.status = status;
        }
        if let Some(detail) = &fields.status_detail_blob {
            job.status_detail_blob = Some(detail.clone());
        }
        if let Some(last_updated) = fields.last_updated {
            job.last_updated = last_updated;
        }
        if let Some(error_msg) = &fields.error_msg {
            job.error_msg = error_msg.clone();
        }
        if let Some(params) = &fields.params_blob {
            job.params_blob = params.clone();
        }
        Ok(())
    }

    async fn update_repair_message(
        &self,
        job_id: &str,
        message: &serde_json::Value,
    ) -> Result<(), ManagerError> {
        self.inner
            .lock()
            .repair_messages
            .insert(job_id.to_string(), message.clone());
        Ok(())
    }
}
