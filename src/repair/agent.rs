//! HTTP client for the on-node repair agent.
//!
//! Both endpoints are bounded by a 3 second timeout; anything but a 200
//! leaves the node in its current state until the next tick.

use std::time::Duration;

use crate::core::ManagerError;

const AGENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Client for the repair agents listening on every worker node.
pub struct AgentClient {
    port: u16,
    client: reqwest::Client,
}

impl AgentClient {
    /// Client against agents on `port`.
    pub fn new(port: u16) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder()
            .timeout(AGENT_TIMEOUT)
            .build()
            .map_err(|e| ManagerError::Agent(e.to_string()))?;
        Ok(Self { port, client })
    }

    /// POST the failing rule names to `/repair`. 200 means the agent
    /// accepted the repair.
    pub async fn send_repair_request(&self, node_ip: &str, rule_names: &[String]) -> bool {
        let url = format!("http://{node_ip}:{}/repair", self.port);
        match self.client.post(&url).json(&rule_names).send().await {
            Ok(resp) => {
                let code = resp.status();
                tracing::debug!("sent repair request to {url}: {rule_names:?}, response {code}");
                code == reqwest::StatusCode::OK
            }
            Err(e) => {
                tracing::error!("failed to send repair request to {url}: {e}");
                false
            }
        }
    }

    /// GET `/liveness`. 200 means the agent is back after repair.
    pub async fn check_liveness(&self, node_ip: &str) -> bool {
        let url = format!("http://{node_ip}:{}/liveness", self.port);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                let code = resp.status();
                tracing::debug!("sent liveness request to {url}, response {code}");
                code == reqwest::StatusCode::OK
            }
            Err(e) => {
                tracing::error!("failed to send liveness request to {url}: {e}");
                false
            }
        }
    }
}
