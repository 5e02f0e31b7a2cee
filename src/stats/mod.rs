// src/stats/mod.rs

//! Analysis result aggregation.
//!
//! Pure functions that turn raw warehouse rows into typed statistical
//! summaries. Nothing in here performs IO; missing or malformed data always
//! degrades to zeroed values instead of an error.

pub mod aggregate;

pub use aggregate::{DatedStat, MetricAnalysis, aggregate_metric_rows, variance_from_sums};
