//! Virtual cluster records and per-VC scheduling policy.

use serde::{Deserialize, Serialize};

/// Per-VC admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Strict head-of-line ordering: one blocked job blocks every later
    /// non-preemptable job in the VC.
    Fifo,
    /// Runnable first: admit any job that fits; no head-of-line blocking.
    #[default]
    RunnableFirst,
}

impl SchedulingPolicy {
    /// Parse the metadata value; unknown values degrade to runnable-first
    /// with an error log.
    pub fn parse(value: &str) -> SchedulingPolicy {
        match value {
            "FIFO" => SchedulingPolicy::Fifo,
            "RF" => SchedulingPolicy::RunnableFirst,
            other => {
                tracing::error!("unknown scheduling_policy {other}, default to RF");
                SchedulingPolicy::RunnableFirst
            }
        }
    }
}

/// Admin block inside VC metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcAdminMetadata {
    /// Scheduling policy name, `"FIFO"` or `"RF"`.
    #[serde(default)]
    pub scheduling_policy: Option<String>,
}

/// Typed view of the VC metadata JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcMetadata {
    /// Per-user GPU ceiling across non-preemptible jobs in this VC.
    #[serde(default)]
    pub user_quota: Option<i64>,
    /// Admin settings.
    #[serde(default)]
    pub admin: Option<VcAdminMetadata>,
}

/// A virtual cluster: a named slice of cluster capacity with its own quotas
/// and scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCluster {
    /// VC name.
    pub vc_name: String,
    /// Raw metadata JSON as stored in the database.
    pub metadata: String,
}

impl VirtualCluster {
    /// Parse the metadata JSON; malformed metadata yields the defaults.
    pub fn parsed_metadata(&self) -> VcMetadata {
        serde_json::from_str(&self.metadata).unwrap_or_else(|e| {
            tracing::warn!("vc {}: malformed metadata ({e}), using defaults", self.vc_name);
            VcMetadata::default()
        })
    }

    /// Effective scheduling policy for this VC.
    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        self.parsed_metadata()
            .admin
            .and_then(|admin| admin.scheduling_policy)
            .map(|policy| SchedulingPolicy::parse(&policy))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(metadata: &str) -> VirtualCluster {
        VirtualCluster {
            vc_name: "v1".to_string(),
            metadata: metadata.to_string(),
        }
    }

    #[test]
    fn policy_defaults_to_runnable_first() {
        assert_eq!(vc("{}").scheduling_policy(), SchedulingPolicy::RunnableFirst);
        assert_eq!(
            vc(r#"{"admin": {"scheduling_policy": "FIFO"}}"#).scheduling_policy(),
            SchedulingPolicy::Fifo
        );
        // unknown policy value degrades to RF
        assert_eq!(
            vc(r#"{"admin": {"scheduling_policy": "LIFO"}}"#).scheduling_policy(),
            SchedulingPolicy::RunnableFirst
        );
    }

    #[test]
    fn user_quota_is_optional() {
        assert_eq!(vc("{}").parsed_metadata().user_quota, None);
        assert_eq!(
            vc(r#"{"user_quota": 8}"#).parsed_metadata().user_quota,
            Some(8)
        );
    }
}
