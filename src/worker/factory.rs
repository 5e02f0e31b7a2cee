// src/worker/factory.rs

//! How the pool creates new worker processes.

use std::time::Duration;

use crate::errors::Result;
use crate::worker::process::WorkerProcess;

/// Creates worker processes for a [`crate::worker::WorkerPool`].
///
/// Production code uses [`CommandWorkerFactory`]; tests can provide a factory
/// that wires workers to in-memory streams.
pub trait WorkerFactory: Send + Sync + 'static {
    /// Start worker number `id`. Must be called from within a Tokio runtime.
    fn spawn(&self, id: u64, request_timeout: Duration) -> Result<WorkerProcess>;
}

/// Spawns each worker by running a shell command line.
#[derive(Debug, Clone)]
pub struct CommandWorkerFactory {
    command_line: String,
}

impl CommandWorkerFactory {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }
}

impl WorkerFactory for CommandWorkerFactory {
    fn spawn(&self, id: u64, request_timeout: Duration) -> Result<WorkerProcess> {
        WorkerProcess::spawn(id, &self.command_line, request_timeout)
    }
}
