//! Job records and the typed view over the `jobParams` blob.
//!
//! The database stores `jobParams` and `jobStatusDetail` as base64-encoded
//! JSON for schema compatibility. Internally each blob is parsed once per
//! tick into [`JobParams`]; write-back only touches the fields mutated by
//! inference scaling so unknown fields survive the round trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::resource::{ClusterResource, ResourceAxis};
use crate::core::ManagerError;
use crate::util::encoding::{b64decode, b64encode};

/// Lifecycle status of a job as stored in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created externally, pending approval.
    Unapproved,
    /// Approved, waiting for admission.
    Queued,
    /// Admitted, workload being launched.
    Scheduling,
    /// Workload running.
    Running,
    /// Terminal: completed successfully.
    Finished,
    /// Terminal: failed.
    Failed,
    /// Kill requested by user.
    Killing,
    /// Terminal: killed.
    Killed,
    /// Pause requested by user.
    Pausing,
    /// Terminal: paused.
    Paused,
}

impl JobStatus {
    /// Database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unapproved => "unapproved",
            JobStatus::Queued => "queued",
            JobStatus::Scheduling => "scheduling",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Killing => "killing",
            JobStatus::Killed => "killed",
            JobStatus::Pausing => "pausing",
            JobStatus::Paused => "paused",
        }
    }

    /// Parse a database status string; `None` for unrecognized values.
    pub fn parse(value: &str) -> Option<JobStatus> {
        serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
    }
}

/// Declared training type of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum TrainingType {
    /// Single-worker training job.
    #[default]
    RegularJob,
    /// Parameter-server distributed training job.
    PSDistJob,
    /// GPU inference job with an elastic preemptable portion.
    InferenceJob,
    /// CPU-only inference job.
    CPUInferenceJob,
    /// Anything else; treated as a training job.
    Unknown,
}

impl<'de> Deserialize<'de> for TrainingType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "RegularJob" => TrainingType::RegularJob,
            "PSDistJob" => TrainingType::PSDistJob,
            "InferenceJob" => TrainingType::InferenceJob,
            "CPUInferenceJob" => TrainingType::CPUInferenceJob,
            _ => TrainingType::Unknown,
        })
    }
}

impl TrainingType {
    /// True only for GPU inference jobs; these get the two-portion
    /// (guaranteed + preemptable) treatment in the scheduler.
    pub fn is_inference(&self) -> bool {
        matches!(self, TrainingType::InferenceJob)
    }

    /// True for every inference flavor; orders after training jobs in the
    /// admission sort to reduce GPU fragmentation.
    pub fn sorts_as_inference(&self) -> bool {
        matches!(self, TrainingType::InferenceJob | TrainingType::CPUInferenceJob)
    }
}

/// Per-axis resource maps as they appear inside `jobParams`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU cores per SKU.
    #[serde(default)]
    pub cpu: ResourceAxis,
    /// Memory per SKU.
    #[serde(default)]
    pub memory: ResourceAxis,
    /// GPU count per SKU.
    #[serde(default)]
    pub gpu: ResourceAxis,
}

impl From<ResourceRequest> for ClusterResource {
    fn from(req: ResourceRequest) -> Self {
        ClusterResource::from_axes(req.cpu, req.memory, req.gpu)
    }
}

/// Typed view over the `jobParams` blob. Parsed once per tick; never
/// serialized back wholesale (see [`rewrite_resourcegpu`]).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobParams {
    /// GPUs requested per worker.
    #[serde(default)]
    pub resourcegpu: f64,
    /// Parameter-server worker count; tolerates string-typed values.
    #[serde(default)]
    pub numpsworker: Option<serde_json::Value>,
    /// Whether the job may be preempted for higher-priority work.
    #[serde(rename = "preemptionAllowed", default)]
    pub preemption_allowed: bool,
    /// Declared training type.
    #[serde(default)]
    pub jobtrainingtype: TrainingType,
    /// Wall-clock runtime ceiling in seconds; tolerates junk values.
    #[serde(rename = "maxTimeSec", default)]
    pub max_time_sec: Option<serde_json::Value>,
    /// Leave failed pods around briefly for post-mortem when set.
    #[serde(default)]
    pub debug: Option<bool>,
    /// Owning user id; tolerates numeric values.
    #[serde(rename = "userId", default)]
    pub user_id: Option<serde_json::Value>,
    /// Job storage path.
    #[serde(rename = "jobPath", default)]
    pub job_path: String,
    /// Work storage path.
    #[serde(rename = "workPath", default)]
    pub work_path: String,
    /// Data storage path.
    #[serde(rename = "dataPath", default)]
    pub data_path: String,
    /// Hardware SKU the job targets.
    #[serde(rename = "gpuType", default)]
    pub gpu_type: Option<String>,
    /// CPU cores requested per worker.
    #[serde(default)]
    pub cpurequest: Option<f64>,
    /// Memory requested per worker.
    #[serde(default)]
    pub memoryrequest: Option<f64>,
    /// Elastic portion of an inference job, revocable at any tick.
    #[serde(default)]
    pub preemptable_resource: Option<ResourceRequest>,
}

fn lenient_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl JobParams {
    /// Parse the base64-JSON blob.
    pub fn from_blob(blob: &str) -> Result<Self, ManagerError> {
        let json = b64decode(blob)?;
        serde_json::from_str(&json).map_err(|e| ManagerError::Codec(format!("jobParams: {e}")))
    }

    /// Worker count, defaulting to one.
    pub fn worker_count(&self) -> i64 {
        self.numpsworker
            .as_ref()
            .and_then(lenient_i64)
            .unwrap_or(1)
            .max(1)
    }

    /// Total GPUs across workers, the unit of user quota accounting.
    pub fn total_gpus(&self) -> i64 {
        self.resourcegpu as i64 * self.worker_count()
    }

    /// Runtime ceiling, `None` when absent or not an integer.
    pub fn max_time(&self) -> Option<i64> {
        self.max_time_sec.as_ref().and_then(lenient_i64)
    }

    /// True when the job asked for post-mortem debugging.
    pub fn debug_enabled(&self) -> bool {
        self.debug == Some(true)
    }

    /// Owning user id as a string, `"0"` when absent.
    pub fn user_id(&self) -> String {
        match &self.user_id {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => "0".to_string(),
        }
    }

    /// SKU label for resource accounting.
    pub fn sku(&self) -> &str {
        match &self.gpu_type {
            Some(t) if !t.is_empty() => t,
            _ => "cpu",
        }
    }

    /// Guaranteed resource request across all workers.
    pub fn resource_request(&self) -> ClusterResource {
        let workers = self.worker_count() as f64;
        let sku = self.sku().to_string();
        ClusterResource::from_axes(
            ResourceAxis::from_pairs([(sku.clone(), self.cpurequest.unwrap_or(0.0) * workers)]),
            ResourceAxis::from_pairs([(sku.clone(), self.memoryrequest.unwrap_or(0.0) * workers)]),
            ResourceAxis::from_pairs([(sku, self.resourcegpu * workers)]),
        )
    }

    /// Elastic portion of an inference job, if declared.
    pub fn preemptable_request(&self) -> Option<ClusterResource> {
        self.preemptable_resource.clone().map(ClusterResource::from)
    }
}

/// Rewrite only `resourcegpu` inside a `jobParams` blob, preserving every
/// other field verbatim.
pub fn rewrite_resourcegpu(blob: &str, gpus: i64) -> Result<String, ManagerError> {
    let json = b64decode(blob)?;
    let mut value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| ManagerError::Codec(format!("jobParams: {e}")))?;
    value["resourcegpu"] = serde_json::Value::from(gpus);
    let rewritten =
        serde_json::to_string(&value).map_err(|e| ManagerError::Codec(e.to_string()))?;
    Ok(b64encode(&rewritten))
}

/// One entry of the user-visible `jobStatusDetail` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailEntry {
    /// Human-readable status message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Start timestamp, set when the job first reports running.
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Finish timestamp, set on terminal transitions.
    #[serde(rename = "finishedAt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// A single message entry.
pub fn message_detail(message: impl Into<String>) -> Vec<DetailEntry> {
    vec![DetailEntry {
        message: Some(message.into()),
        ..DetailEntry::default()
    }]
}

/// Encode a detail list into its base64-JSON blob.
pub fn encode_detail(detail: &[DetailEntry]) -> Result<String, ManagerError> {
    let json = serde_json::to_string(detail).map_err(|e| ManagerError::Codec(e.to_string()))?;
    Ok(b64encode(&json))
}

/// Append a terminal entry stamping the finish time.
pub fn detail_with_finished_time(
    mut detail: Vec<DetailEntry>,
    status_word: &str,
    at: DateTime<Utc>,
) -> Vec<DetailEntry> {
    let stamp = at.to_rfc3339();
    detail.push(DetailEntry {
        message: Some(format!("{status_word} at: {stamp}")),
        finished_at: Some(stamp),
        ..DetailEntry::default()
    });
    detail
}

/// A job record as stored in the `Jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub job_id: String,
    /// Owning user.
    pub user_name: String,
    /// Virtual cluster the job belongs to.
    pub vc_name: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Base64-encoded JSON parameter blob.
    pub params_blob: String,
    /// Submission instant.
    pub job_time: DateTime<Utc>,
    /// Last status transition instant; doubles as the queue time.
    pub last_updated: DateTime<Utc>,
    /// Last error, if any.
    pub error_msg: String,
    /// Base64-encoded JSON detail list shown to the user.
    pub status_detail_blob: Option<String>,
}

impl Job {
    /// Parse the parameter blob into its typed view.
    pub fn params(&self) -> Result<JobParams, ManagerError> {
        JobParams::from_blob(&self.params_blob)
    }

    /// Decode the detail blob; empty (never an error) when absent or
    /// malformed, since the detail is advisory.
    pub fn decode_detail(&self) -> Vec<DetailEntry> {
        let Some(blob) = &self.status_detail_blob else {
            return Vec::new();
        };
        b64decode(blob)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(json: &str) -> String {
        b64encode(json)
    }

    #[test]
    fn parses_typical_params() {
        let params = JobParams::from_blob(&blob(
            r#"{"resourcegpu": 2, "numpsworker": "4", "preemptionAllowed": true,
                "jobtrainingtype": "PSDistJob", "gpuType": "A100",
                "maxTimeSec": 3600, "userId": 7}"#,
        ))
        .unwrap();
        assert_eq!(params.worker_count(), 4);
        assert_eq!(params.total_gpus(), 8);
        assert!(params.preemption_allowed);
        assert_eq!(params.max_time(), Some(3600));
        assert_eq!(params.user_id(), "7");
        assert_eq!(params.resource_request().gpu.get("A100"), 8.0);
    }

    #[test]
    fn tolerates_junk_max_time() {
        let params =
            JobParams::from_blob(&blob(r#"{"resourcegpu": 1, "maxTimeSec": "soon"}"#)).unwrap();
        assert_eq!(params.max_time(), None);
    }

    #[test]
    fn unknown_training_type_is_a_training_job() {
        let params =
            JobParams::from_blob(&blob(r#"{"jobtrainingtype": "SomethingNew"}"#)).unwrap();
        assert!(!params.jobtrainingtype.is_inference());
        assert!(!params.jobtrainingtype.sorts_as_inference());
    }

    #[test]
    fn resourcegpu_rewrite_preserves_unknown_fields() {
        let original = blob(r#"{"resourcegpu": 4, "customField": "keep-me"}"#);
        let rewritten = rewrite_resourcegpu(&original, 2).unwrap();
        let json = b64decode(&rewritten).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["resourcegpu"], 2);
        assert_eq!(value["customField"], "keep-me");
    }

    #[test]
    fn detail_round_trip() {
        let detail = message_detail("waiting for available resource.");
        let encoded = encode_detail(&detail).unwrap();
        let decoded: Vec<DetailEntry> =
            serde_json::from_str(&b64decode(&encoded).unwrap()).unwrap();
        assert_eq!(
            decoded[0].message.as_deref(),
            Some("waiting for available resource.")
        );
    }
}
