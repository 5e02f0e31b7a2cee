// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Cycle detected in query DAG: {0}")]
    DagCycle(String),

    #[error("Query '{query}' failed: {message}")]
    QueryFailed { query: String, message: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Analysis run {0} was superseded by a newer run")]
    RunSuperseded(uuid::Uuid),

    #[error("Worker request {0} timed out")]
    WorkerTimeout(String),

    #[error("Worker terminated")]
    WorkerTerminated,

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StatdagError {
    /// Errors that reject a single worker call but leave the worker usable.
    pub fn is_worker_local(&self) -> bool {
        matches!(self, StatdagError::WorkerTimeout(_) | StatdagError::WorkerError(_))
    }
}

pub type Result<T> = std::result::Result<T, StatdagError>;
