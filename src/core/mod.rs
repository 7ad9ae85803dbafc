//! Shared data model and resource arithmetic.

pub mod error;
pub mod job;
pub mod resource;
pub mod vc;

pub use error::{AppResult, ManagerError};
pub use job::{
    detail_with_finished_time, encode_detail, message_detail, rewrite_resourcegpu, DetailEntry,
    Job, JobParams, JobStatus, ResourceRequest, TrainingType,
};
pub use resource::{ClusterResource, ResourceAxis};
pub use vc::{SchedulingPolicy, VcMetadata, VirtualCluster};
