// src/dag/mod.rs

//! Query DAG representation and scheduling.
//!
//! - [`graph`] holds the validated dependency graph of declared queries.
//! - [`query`] defines query declarations and their per-run state.
//! - [`scheduler`] contains the per-run state machine that decides which
//!   queries are ready to dispatch and propagates failures to dependents.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages per-run state transitions.

pub mod graph;
pub mod query;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;

pub use graph::{DagGraph, validate_definitions};
pub use query::{
    ProcessedResult, Query, QueryDefinition, QueryName, QueryOutcome, QueryProcessor,
    ScheduledQuery,
};
pub use scheduler::{QueryMap, Scheduler};
pub use scheduler_step::SchedulerStep;
