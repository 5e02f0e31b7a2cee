// src/engine/mod.rs

//! Orchestration engine for statdag.
//!
//! This module ties together:
//! - the [`Analysis`] contract (permission gate, query declaration, final
//!   aggregation) and the config-driven [`ConfiguredAnalysis`]
//! - the query scheduler from [`crate::dag`]
//! - the per-run driver that dispatches waves to a query executor
//! - the [`ModelStore`] the run state is persisted through
//!
//! The pure state machine lives in [`crate::dag::scheduler`]; the async/IO
//! shell is implemented in [`runtime`].

pub mod analysis;
pub mod orchestrator;
pub mod run;
pub mod runtime;
pub mod store;

pub use analysis::{Analysis, AnalysisOutput, ConfiguredAnalysis, RunParams};
pub use orchestrator::{Orchestrator, RunHandle};
pub use run::{AnalysisRun, AnalysisUpdate, Entity, rollup_status};
pub use runtime::RunDriver;
pub use store::{InMemoryModelStore, JsonFileModelStore, ModelStore};
