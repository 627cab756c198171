//! Error types for the async pipeline

use std::time::Duration;

use thiserror::Error;

use pw_core::NormalizationError;

/// Worker pool failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No worker became free within {0:?}")]
    QueueTimeout(Duration),

    #[error("Worker {slot} did not reply within {timeout:?}")]
    DispatchTimeout { slot: usize, timeout: Duration },

    #[error("Worker {slot} faulted: {reason}")]
    WorkerFault { slot: usize, reason: String },

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Worker pool is not initialized")]
    NotInitialized,
}

/// Failure reported by the host's interception layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Interception host error: {0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Pipeline is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
