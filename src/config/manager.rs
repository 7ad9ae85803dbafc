//! Manager configuration structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::infra::email::EmailConfig;

/// Launcher backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LauncherConfig {
    /// In-process launcher.
    #[default]
    Process,
    /// Stub delegating to an external controller.
    Controller,
}

fn default_storage_mount_path() -> String {
    "/storage".to_string()
}

/// Job manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManagerConfig {
    /// Launcher backend.
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// Mount point of the shared storage holding job logs.
    #[serde(default = "default_storage_mount_path")]
    pub storage_mount_path: String,
    /// SMTP settings for user notifications; log-only when absent.
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            storage_mount_path: default_storage_mount_path(),
            email: None,
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_agent_port() -> u16 {
    9081
}

/// Repair manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Rule names to instantiate; empty uses the default rule set.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Seconds between repair ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Port of the on-node repair agents.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    /// Log intended patches without mutating Kubernetes.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            interval_secs: default_interval_secs(),
            agent_port: default_agent_port(),
            dry_run: false,
        }
    }
}

fn default_kube_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

/// Kubernetes API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// API server base URL.
    #[serde(default = "default_kube_api_url")]
    pub api_url: String,
    /// Bearer token, if the server requires one.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_url: default_kube_api_url(),
            token: None,
        }
    }
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}

/// Root configuration, read from `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Cluster name used in alerts.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Job manager settings.
    #[serde(default)]
    pub job_manager: JobManagerConfig,
    /// Repair manager settings.
    #[serde(default)]
    pub repair: RepairConfig,
    /// Kubernetes access.
    #[serde(default)]
    pub kube: KubeConfig,
    /// Free-form deployment values passed through to rules.
    #[serde(default)]
    pub extras: HashMap<String, serde_yaml::Value>,
}

impl ManagerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.repair.interval_secs == 0 {
            return Err("repair.interval_secs must be greater than 0".into());
        }
        if self.kube.api_url.is_empty() {
            return Err("kube.api_url must not be empty".into());
        }
        if let Some(email) = &self.job_manager.email {
            if email.smtp_url.is_empty() || email.sender.is_empty() {
                return Err("job_manager.email requires smtp_url and sender".into());
            }
        }
        Ok(())
    }

    /// Parse configuration from a YAML string and validate.
    pub fn from_yaml_str(input: &str) -> Result<Self, String> {
        let cfg: ManagerConfig =
            serde_yaml::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate `config.yaml` from a directory or file path.
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let file = if path.is_dir() {
            path.join("config.yaml")
        } else {
            path.to_path_buf()
        };
        let contents =
            std::fs::read_to_string(&file).map_err(|e| format!("{}: {e}", file.display()))?;
        Self::from_yaml_str(&contents)
    }
}
