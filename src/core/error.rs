//! Error types for the control loops.

use thiserror::Error;

/// Errors produced by manager components.
///
/// Everything here is transient from the loop's point of view: the tick is
/// abandoned for the affected entity only and retried on the next iteration.
/// Semantic denials (quota exceeded, resource insufficient) are not errors;
/// they are written to the job's status detail instead.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Persistence layer failure with context.
    #[error("store error: {0}")]
    Store(String),
    /// Kubernetes API failure with context.
    #[error("kubernetes error: {0}")]
    Kube(String),
    /// Launcher backend failure with context.
    #[error("launcher error: {0}")]
    Launcher(String),
    /// Node agent request failure with context.
    #[error("agent error: {0}")]
    Agent(String),
    /// Coordination store failure; never blocks a state transition.
    #[error("timing store error: {0}")]
    Timing(String),
    /// Blob or JSON decode failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// Invalid configuration; fatal at startup.
    #[error("config invalid: {0}")]
    Config(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
