//! Coordination store seam for the per-job latency records.
//!
//! The store holds only the latency record per job id, keyed
//! `job_status_<id>`. Access is first-read/then-write with no CAS; races
//! between manager instances are tolerated because fields are monotonic
//! (set once). Failures here never block a state transition.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use crate::core::ManagerError;

/// Coordination store key for a job's latency record.
pub fn job_status_key(job_id: &str) -> String {
    format!("job_status_{job_id}")
}

/// GET/SET view over the coordination store.
#[async_trait]
pub trait TimingStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>, ManagerError>;

    /// Write a key.
    async fn set(&self, key: &str, value: &str) -> Result<(), ManagerError>;
}

/// In-memory timing store for tests and development.
#[derive(Default)]
pub struct InMemoryTimingStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryTimingStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimingStore for InMemoryTimingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ManagerError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ManagerError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Redis-backed timing store.
pub struct RedisTimingStore {
    client: redis::Client,
}

impl RedisTimingStore {
    /// Connect to a local redis on `port`.
    pub fn new(port: u16) -> Result<Self, ManagerError> {
        let client = redis::Client::open(format!("redis://127.0.0.1:{port}/"))
            .map_err(|e| ManagerError::Timing(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TimingStore for RedisTimingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ManagerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ManagerError::Timing(e.to_string()))?;
        conn.get(key)
            .await
            .map_err(|e| ManagerError::Timing(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ManagerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ManagerError::Timing(e.to_string()))?;
        conn.set(key, value)
            .await
            .map_err(|e| ManagerError::Timing(e.to_string()))
    }
}
