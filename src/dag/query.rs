// src/dag/query.rs

//! Query declarations and their per-run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exec::Row;
use crate::stats::{MetricAnalysis, aggregate_metric_rows};
use crate::types::QueryStatus;

/// Canonical query name type used throughout the DAG.
pub type QueryName = String;

/// Pure transform applied to a query's raw rows before they are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryProcessor {
    /// Keep the rows as returned.
    #[default]
    Passthrough,
    /// Aggregate `count` / `main_sum` / `main_sum_squares` rows.
    MetricStats,
    /// Keep only the first row.
    SingleRow,
}

impl QueryProcessor {
    pub fn process(self, rows: &[Row]) -> ProcessedResult {
        match self {
            QueryProcessor::Passthrough => ProcessedResult::Rows(rows.to_vec()),
            QueryProcessor::MetricStats => ProcessedResult::Metric(aggregate_metric_rows(rows)),
            QueryProcessor::SingleRow => ProcessedResult::Row(rows.first().cloned()),
        }
    }
}

/// Typed output of a [`QueryProcessor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProcessedResult {
    Rows(Vec<Row>),
    Metric(MetricAnalysis),
    Row(Option<Row>),
}

/// A query as declared by an analysis, before any run state exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub name: QueryName,
    /// Opaque executor-specific payload (SQL text, shell command, ...).
    pub statement: String,
    pub query_type: String,
    pub dependencies: Vec<QueryName>,
    pub processor: QueryProcessor,
    /// Failure of a required query fails the whole run; optional failures
    /// only downgrade it to `partial`.
    pub required: bool,
    /// Dispatch only after every non-`run_at_end` query is terminal.
    pub run_at_end: bool,
}

impl QueryDefinition {
    pub fn new(name: impl Into<QueryName>, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statement: statement.into(),
            query_type: "sql".to_string(),
            dependencies: Vec::new(),
            processor: QueryProcessor::default(),
            required: true,
            run_at_end: false,
        }
    }

    pub fn after(mut self, dep: impl Into<QueryName>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn processor(mut self, processor: QueryProcessor) -> Self {
        self.processor = processor;
        self
    }

    pub fn query_type(mut self, query_type: impl Into<String>) -> Self {
        self.query_type = query_type.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn run_at_end(mut self) -> Self {
        self.run_at_end = true;
        self
    }
}

/// A query inside one analysis run. This is also the persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub name: QueryName,
    #[serde(rename = "query")]
    pub statement: String,
    pub query_type: String,
    #[serde(default)]
    pub dependencies: Vec<QueryName>,
    #[serde(default)]
    pub processor: QueryProcessor,
    pub required: bool,
    #[serde(default)]
    pub run_at_end: bool,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_result: Option<ProcessedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Query {
    pub fn from_definition(def: &QueryDefinition) -> Self {
        Self {
            name: def.name.clone(),
            statement: def.statement.clone(),
            query_type: def.query_type.clone(),
            dependencies: def.dependencies.clone(),
            processor: def.processor,
            required: def.required,
            run_at_end: def.run_at_end,
            status: QueryStatus::Pending,
            external_id: None,
            raw_result: None,
            processed_result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Description of a query the scheduler wants the executor to run now.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledQuery {
    pub name: QueryName,
    pub statement: String,
    pub query_type: String,
    /// All queries dispatched for the same analysis run share this id.
    pub run_id: Uuid,
}

impl ScheduledQuery {
    pub fn from_query(query: &Query, run_id: Uuid) -> Self {
        Self {
            name: query.name.clone(),
            statement: query.statement.clone(),
            query_type: query.query_type.clone(),
            run_id,
        }
    }
}

/// Outcome of one executor call, as fed back into the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Success(Vec<Row>),
    Failed(String),
}
