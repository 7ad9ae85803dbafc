//! Per-job state-change latency probe.
//!
//! A [`JobTimeRecord`] in the coordination store remembers when a job was
//! created, approved, submitted and first seen running. Each field is set at
//! most once; the histogram is emitted on a transition only when both the
//! new and the immediately prior timestamp are present. If the prior one is
//! missing (manager restart, expired record) the observation is silently
//! skipped for that job.

use chrono::{DateTime, Utc};
use prometheus::{HistogramOpts, HistogramVec, Registry};
use serde::{Deserialize, Serialize};

use crate::core::ManagerError;
use crate::infra::timing::{job_status_key, TimingStore};
use crate::util::clock::elapsed_secs;

/// Latency record for one job, stored as JSON in the coordination store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimeRecord {
    /// When the job was created (submitted by the user).
    pub create_time: Option<f64>,
    /// When the job was approved into the queue.
    pub approve_time: Option<f64>,
    /// When the job was submitted to the launcher.
    pub submit_time: Option<f64>,
    /// When the job was first seen running.
    pub running_time: Option<f64>,
}

impl JobTimeRecord {
    /// Parse the stored JSON; any failure yields an empty record.
    pub fn parse(value: &str) -> JobTimeRecord {
        serde_json::from_str(value).unwrap_or_default()
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<String, ManagerError> {
        serde_json::to_string(self).map_err(|e| ManagerError::Codec(e.to_string()))
    }
}

/// The state whose entry latency is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Job row created.
    Created,
    /// Approved into `queued`.
    Approved,
    /// Submitted to the launcher (`scheduling`).
    Scheduling,
    /// First observed `running`.
    Running,
}

impl JobState {
    /// Histogram label value.
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Approved => "approved",
            JobState::Scheduling => "scheduling",
            JobState::Running => "running",
        }
    }
}

/// Owner of the `job_state_change_latency_seconds` histogram.
#[derive(Clone)]
pub struct StateLatency {
    histogram: HistogramVec,
}

impl StateLatency {
    /// Create and register the histogram.
    pub fn new(registry: &Registry) -> Result<Self, ManagerError> {
        let buckets = vec![
            1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0,
        ];
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "job_state_change_latency_seconds",
                "latency for job to change state (seconds)",
            )
            .buckets(buckets),
            &["current_state"],
        )
        .map_err(|e| ManagerError::Config(e.to_string()))?;
        registry
            .register(Box::new(histogram.clone()))
            .map_err(|e| ManagerError::Config(e.to_string()))?;
        Ok(Self { histogram })
    }

    /// Unregistered histogram for tests.
    pub fn unregistered() -> Self {
        let registry = Registry::new();
        match Self::new(&registry) {
            Ok(latency) => latency,
            Err(_) => unreachable!("histogram construction is infallible"),
        }
    }

    fn observe(&self, state: JobState, seconds: f64) {
        self.histogram
            .with_label_values(&[state.label()])
            .observe(seconds);
    }

    /// Sum of observations for a state, for tests.
    pub fn sample_count(&self, state: JobState) -> u64 {
        self.histogram
            .with_label_values(&[state.label()])
            .get_sample_count()
    }
}

fn set_once(slot: &mut Option<f64>, at: DateTime<Utc>) -> bool {
    if slot.is_none() {
        *slot = Some(at.timestamp() as f64);
        true
    } else {
        false
    }
}

fn prior_instant(ts: Option<f64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t as i64, 0))
}

/// Record that `job_id` entered `state` at `event_time`, emitting the
/// histogram when the prior timestamp is known. Failures of the coordination
/// store are surfaced to the caller, which logs and carries on; they never
/// block a state transition.
pub async fn update_job_state_latency(
    timing: &dyn TimingStore,
    latency: &StateLatency,
    job_id: &str,
    state: JobState,
    event_time: DateTime<Utc>,
) -> Result<(), ManagerError> {
    let key = job_status_key(job_id);
    let mut record = match timing.get(&key).await? {
        Some(value) => JobTimeRecord::parse(&value),
        None => JobTimeRecord::default(),
    };

    let changed = match state {
        JobState::Created => set_once(&mut record.create_time, event_time),
        JobState::Approved => {
            let changed = set_once(&mut record.approve_time, event_time);
            if changed {
                if let Some(prior) = prior_instant(record.create_time) {
                    latency.observe(state, elapsed_secs(prior, event_time) as f64);
                }
            }
            changed
        }
        JobState::Scheduling => {
            let changed = set_once(&mut record.submit_time, event_time);
            if changed {
                if let Some(prior) = prior_instant(record.approve_time) {
                    latency.observe(state, elapsed_secs(prior, event_time) as f64);
                }
            }
            changed
        }
        JobState::Running => {
            let changed = set_once(&mut record.running_time, event_time);
            // the running state is re-observed every tick, so only the
            // first sighting may emit
            if changed {
                if let Some(prior) = prior_instant(record.submit_time) {
                    latency.observe(state, elapsed_secs(prior, event_time) as f64);
                }
            }
            changed
        }
    };

    if changed {
        timing.set(&key, &record.to_json()?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::timing::InMemoryTimingStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn record_round_trips() {
        let record = JobTimeRecord {
            create_time: Some(100.0),
            approve_time: Some(160.0),
            submit_time: None,
            running_time: None,
        };
        assert_eq!(JobTimeRecord::parse(&record.to_json().unwrap()), record);
    }

    #[tokio::test]
    async fn observes_only_with_both_endpoints() {
        let timing = InMemoryTimingStore::new();
        let latency = StateLatency::unregistered();

        // approved without a created record: no observation, field still set
        update_job_state_latency(&timing, &latency, "j1", JobState::Approved, at(50))
            .await
            .unwrap();
        assert_eq!(latency.sample_count(JobState::Approved), 0);

        // scheduling after approved: one observation
        update_job_state_latency(&timing, &latency, "j1", JobState::Scheduling, at(80))
            .await
            .unwrap();
        assert_eq!(latency.sample_count(JobState::Scheduling), 1);
    }

    #[tokio::test]
    async fn fields_are_set_once() {
        let timing = InMemoryTimingStore::new();
        let latency = StateLatency::unregistered();

        update_job_state_latency(&timing, &latency, "j1", JobState::Running, at(10))
            .await
            .unwrap();
        update_job_state_latency(&timing, &latency, "j1", JobState::Running, at(99))
            .await
            .unwrap();

        let stored = timing.get(&job_status_key("j1")).await.unwrap();
        let record = JobTimeRecord::parse(&stored.unwrap_or_default());
        assert_eq!(record.running_time, Some(10.0));
    }
}
