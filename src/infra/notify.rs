//! Outbound user notifications.
//!
//! A producer queue feeds a consumer task so notification delivery never
//! blocks a manager tick. Sinks are pluggable; delivery failures are logged
//! and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::ManagerError;

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Recipient user name.
    pub user: String,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
}

/// Message for a job state change.
pub fn new_job_state_change_message(user: &str, job_id: &str, result: &str) -> Notification {
    Notification {
        user: user.to_string(),
        subject: format!("Job {job_id} is {result}"),
        body: format!("Job {job_id} of user {user} changed to status {result}."),
    }
}

/// Message for a job killed by the platform.
pub fn new_job_killed_message(user: &str, job_id: &str, reason: &str) -> Notification {
    Notification {
        user: user.to_string(),
        subject: format!("Job {job_id} was killed"),
        body: format!("Job {job_id} of user {user} was killed: {reason}"),
    }
}

/// Delivery backend for notifications.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver one message.
    async fn deliver(&self, notification: &Notification) -> Result<(), ManagerError>;
}

/// Sink that only logs, for clusters without a messaging integration.
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), ManagerError> {
        tracing::info!(
            "notify {}: {} - {}",
            notification.user,
            notification.subject,
            notification.body
        );
        Ok(())
    }
}

/// Sink that records messages, for tests and dry runs.
#[derive(Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered so far.
    pub fn messages(&self) -> Vec<Notification> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl MessageSink for CollectingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), ManagerError> {
        self.messages.lock().push(notification.clone());
        Ok(())
    }
}

/// Handle to the notifier queue. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Spawn the consumer task over `sink` and return the producer handle.
    pub fn spawn(sink: Arc<dyn MessageSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Err(e) = sink.deliver(&notification).await {
                    tracing::error!(
                        "failed to deliver notification to {}: {e}",
                        notification.user
                    );
                }
            }
        });
        Self { tx }
    }

    /// Enqueue a message; never blocks.
    pub fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::error!("notifier queue closed, dropping message");
        }
    }
}
