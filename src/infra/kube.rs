//! Kubernetes control plane seam.
//!
//! The repair manager mutates node state through a single atomic patch of
//! `{unschedulable, labels, annotations}` so a repair transition is one
//! write. A REST implementation talks to the API server; an in-memory
//! implementation backs tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::core::{DetailEntry, ManagerError};

/// A node as observed from the API server.
#[derive(Debug, Clone, Default)]
pub struct KubeNode {
    /// Node name.
    pub name: String,
    /// Internal IP, target of node agent requests.
    pub ip: String,
    /// Cordon flag.
    pub unschedulable: bool,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
    /// Node annotations.
    pub annotations: BTreeMap<String, String>,
}

/// A pod as observed from the API server, reduced to job attribution.
#[derive(Debug, Clone, Default)]
pub struct KubePod {
    /// Pod name.
    pub name: String,
    /// Hosting node, if scheduled.
    pub node_name: Option<String>,
    /// Owning job id from the pod labels.
    pub job_id: Option<String>,
    /// Owning user from the pod labels.
    pub user_name: Option<String>,
    /// Owning VC from the pod labels.
    pub vc_name: Option<String>,
    /// Pod phase.
    pub phase: String,
}

/// One atomic node mutation. `None` in a label/annotation value clears the
/// key on the server.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    /// New cordon flag, unchanged when `None`.
    pub unschedulable: Option<bool>,
    /// Labels to set or clear.
    pub labels: BTreeMap<String, Option<String>>,
    /// Annotations to set or clear.
    pub annotations: BTreeMap<String, Option<String>>,
}

impl NodePatch {
    /// True when the patch would not change anything.
    pub fn is_empty(&self) -> bool {
        self.unschedulable.is_none() && self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// Narrow view over the Kubernetes API consumed by the managers.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// All nodes.
    async fn list_nodes(&self) -> Result<Vec<KubeNode>, ManagerError>;

    /// All pods.
    async fn list_pods(&self) -> Result<Vec<KubePod>, ManagerError>;

    /// Apply one atomic patch to a node.
    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ManagerError>;

    /// Distinct values of a node label key across the cluster.
    async fn get_node_labels(&self, key: &str) -> Result<Vec<String>, ManagerError>;

    /// Pod-level status detail for a job, shown while it is pending.
    async fn get_job_status_detail(&self, job_id: &str)
        -> Result<Vec<DetailEntry>, ManagerError>;
}

/// REST client against the API server.
pub struct RestKube {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RestKube {
    /// Build a client for `base_url` (e.g. `https://10.0.0.1:6443`), with an
    /// optional bearer token.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ManagerError::Kube(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            token,
            client,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ManagerError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ManagerError::Kube(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ManagerError::Kube(format!("GET {path}: {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| ManagerError::Kube(e.to_string()))
    }

    fn parse_node(item: &serde_json::Value) -> KubeNode {
        let string_map = |v: &serde_json::Value| -> BTreeMap<String, String> {
            v.as_object()
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };
        let ip = item["status"]["addresses"]
            .as_array()
            .and_then(|addrs| {
                addrs
                    .iter()
                    .find(|a| a["type"] == "InternalIP")
                    .and_then(|a| a["address"].as_str())
            })
            .unwrap_or_default()
            .to_string();
        KubeNode {
            name: item["metadata"]["name"].as_str().unwrap_or_default().to_string(),
            ip,
            unschedulable: item["spec"]["unschedulable"].as_bool().unwrap_or(false),
            labels: string_map(&item["metadata"]["labels"]),
            annotations: string_map(&item["metadata"]["annotations"]),
        }
    }

    fn parse_pod(item: &serde_json::Value) -> KubePod {
        let label = |key: &str| -> Option<String> {
            item["metadata"]["labels"][key].as_str().map(str::to_string)
        };
        KubePod {
            name: item["metadata"]["name"].as_str().unwrap_or_default().to_string(),
            node_name: item["spec"]["nodeName"].as_str().map(str::to_string),
            job_id: label("jobId"),
            user_name: label("userName"),
            vc_name: label("vcName"),
            phase: item["status"]["phase"].as_str().unwrap_or_default().to_string(),
        }
    }
}

#[async_trait]
impl KubeApi for RestKube {
    async fn list_nodes(&self) -> Result<Vec<KubeNode>, ManagerError> {
        let body = self.get_json("/api/v1/nodes").await?;
        Ok(body["items"]
            .as_array()
            .map(|items| items.iter().map(Self::parse_node).collect())
            .unwrap_or_default())
    }

    async fn list_pods(&self) -> Result<Vec<KubePod>, ManagerError> {
        let body = self.get_json("/api/v1/pods").await?;
        Ok(body["items"]
            .as_array()
            .map(|items| items.iter().map(Self::parse_pod).collect())
            .unwrap_or_default())
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ManagerError> {
        let mut body = json!({});
        if let Some(unschedulable) = patch.unschedulable {
            body["spec"] = json!({ "unschedulable": unschedulable });
        }
        if !patch.labels.is_empty() {
            body["metadata"]["labels"] = json!(patch.labels);
        }
        if !patch.annotations.is_empty() {
            body["metadata"]["annotations"] = json!(patch.annotations);
        }
        let url = format!("{}/api/v1/nodes/{name}", self.base_url);
        let resp = self
            .request(self.client.patch(&url))
            .header("Content-Type", "application/strategic-merge-patch+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ManagerError::Kube(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ManagerError::Kube(format!(
                "patch node {name}: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get_node_labels(&self, key: &str) -> Result<Vec<String>, ManagerError> {
        let nodes = self.list_nodes().await?;
        let mut values: Vec<String> = nodes
            .iter()
            .filter_map(|node| node.labels.get(key).cloned())
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn get_job_status_detail(
        &self,
        job_id: &str,
    ) -> Result<Vec<DetailEntry>, ManagerError> {
        let pods = self.list_pods().await?;
        Ok(pods
            .iter()
            .filter(|pod| pod.job_id.as_deref() == Some(job_id))
            .map(|pod| DetailEntry {
                message: Some(format!("pod {} is {}", pod.name, pod.phase)),
                ..DetailEntry::default()
            })
            .collect())
    }
}

#[derive(Default)]
struct KubeInner {
    nodes: BTreeMap<String, KubeNode>,
    pods: Vec<KubePod>,
    fail_patches: bool,
    patch_count: usize,
}

/// In-memory API server for tests and development.
#[derive(Default)]
pub struct InMemoryKube {
    inner: Mutex<KubeInner>,
}

impl InMemoryKube {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn put_node(&self, node: KubeNode) {
        self.inner.lock().nodes.insert(node.name.clone(), node);
    }

    /// Insert a pod.
    pub fn put_pod(&self, pod: KubePod) {
        self.inner.lock().pods.push(pod);
    }

    /// Make every subsequent patch fail, to exercise partial-failure paths.
    pub fn fail_patches(&self, fail: bool) {
        self.inner.lock().fail_patches = fail;
    }

    /// Number of patches applied or attempted so far.
    pub fn patch_count(&self) -> usize {
        self.inner.lock().patch_count
    }

    /// Current state of a node.
    pub fn node(&self, name: &str) -> Option<KubeNode> {
        self.inner.lock().nodes.get(name).cloned()
    }
}

#[async_trait]
impl KubeApi for InMemoryKube {
    async fn list_nodes(&self) -> Result<Vec<KubeNode>, ManagerError> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }

    async fn list_pods(&self) -> Result<Vec<KubePod>, ManagerError> {
        Ok(self.inner.lock().pods.clone())
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock();
        inner.patch_count += 1;
        if inner.fail_patches {
            return Err(ManagerError::Kube("injected patch failure".to_string()));
        }
        let node = inner
            .nodes
            .get_mut(name)
            .ok_or_else(|| ManagerError::Kube(format!("no such node {name}")))?;
        if let Some(unschedulable) = patch.unschedulable {
            node.unschedulable = unschedulable;
        }
        for (key, value) in &patch.labels {
            match value {
                Some(value) => {
                    node.labels.insert(key.clone(), value.clone());
                }
                None => {
                    node.labels.remove(key);
                }
            }
        }
        for (key, value) in &patch.annotations {
            match value {
                Some(value) => {
                    node.annotations.insert(key.clone(), value.clone());
                }
                None => {
                    node.annotations.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn get_node_labels(&self, key: &str) -> Result<Vec<String>, ManagerError> {
        let inner = self.inner.lock();
        let mut values: Vec<String> = inner
            .nodes
            .values()
            .filter_map(|node| node.labels.get(key).cloned())
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn get_job_status_detail(
        &self,
        job_id: &str,
    ) -> Result<Vec<DetailEntry>, ManagerError> {
        let inner = self.inner.lock();
        Ok(inner
            .pods
            .iter()
            .filter(|pod| pod.job_id.as_deref() == Some(job_id))
            .map(|pod| DetailEntry {
                message: Some(format!("pod {} is {}", pod.name, pod.phase)),
                ..DetailEntry::default()
            })
            .collect())
    }
}
