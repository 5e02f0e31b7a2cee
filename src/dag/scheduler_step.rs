// src/dag/scheduler_step.rs

//! Step-by-step execution result types for the scheduler.

use crate::dag::query::{QueryName, ScheduledQuery};

/// Structured result of a single scheduler "step".
///
/// This is useful for tests that want to manually step the DAG and make
/// assertions about what changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Queries that became ready and were marked `Running` in this step.
    pub newly_scheduled: Vec<ScheduledQuery>,
    /// Queries newly marked as failed in this step (the query that failed
    /// first, followed by dependents skipped because of it).
    pub newly_failed: Vec<QueryName>,
    /// Whether every query is now terminal.
    pub run_just_finished: bool,
}
