//! Configuration models for the managers.

pub mod manager;

pub use manager::{JobManagerConfig, KubeConfig, LauncherConfig, ManagerConfig, RepairConfig};
