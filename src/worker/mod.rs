// src/worker/mod.rs

//! Out-of-process statistics workers.
//!
//! - [`protocol`] defines the newline-delimited JSON request/response lines.
//! - [`correlator`] matches responses to pending calls and evicts timed-out
//!   calls using a deadline heap.
//! - [`process`] owns one worker process: stdin writer, stdout supervisor,
//!   liveness flag.
//! - [`pool`] bounds how many workers exist and brokers checkout/checkin.
//! - [`factory`] abstracts how a worker is started, so tests can swap in
//!   in-memory workers.

pub mod correlator;
pub mod factory;
pub mod pool;
pub mod process;
pub mod protocol;

pub use correlator::Correlator;
pub use factory::{CommandWorkerFactory, WorkerFactory};
pub use pool::{PoolConfig, PoolStats, PooledWorker, WorkerPool};
pub use process::WorkerProcess;
pub use protocol::{WorkerOutput, WorkerRequest, WorkerResponse};
