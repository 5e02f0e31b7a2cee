// src/engine/analysis.rs

//! The contract an analysis implements, plus the config-driven analysis the
//! binary runs.

use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::ConfigFile;
use crate::dag::{ProcessedResult, QueryDefinition, QueryMap};
use crate::errors::{Result, StatdagError};
use crate::stats::{MetricAnalysis, aggregate_metric_rows};
use crate::worker::WorkerPool;

/// A declarative analysis: which queries to run and how to fold their
/// processed results into one output.
pub trait Analysis: Send + Sync + 'static {
    type Params: Send + Sync + 'static;
    type Output: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Gate run before any query is declared. An error aborts the run with
    /// no side effects.
    fn check_permissions(&self, params: &Self::Params) -> Result<()>;

    /// The queries of one run, with their dependency edges.
    fn declare_queries(&self, params: &Self::Params) -> Result<Vec<QueryDefinition>>;

    /// Aggregate once every query is terminal. Failed queries carry no
    /// `processed_result`; implementations must fall back to defaults.
    fn run_analysis<'a>(
        &'a self,
        params: &'a Self::Params,
        queries: &'a QueryMap,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output>> + Send + 'a>>;
}

/// Parameters of a [`ConfiguredAnalysis`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub user: String,
}

impl RunParams {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Output of a [`ConfiguredAnalysis`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub metric: MetricAnalysis,
    /// `results` of the worker call, when the summary was delegated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
    /// Seconds the worker reported for the delegated call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_time: Option<f64>,
}

/// Analysis built from a config file: an allow-list of users, the declared
/// queries, and the metric summary of one query, optionally refined by a
/// worker process.
#[derive(Debug, Clone)]
pub struct ConfiguredAnalysis {
    queries: Vec<QueryDefinition>,
    metric_query: String,
    allowed_users: Vec<String>,
    pool: Option<WorkerPool>,
}

impl ConfiguredAnalysis {
    pub fn new(queries: Vec<QueryDefinition>, metric_query: impl Into<String>) -> Self {
        Self {
            queries,
            metric_query: metric_query.into(),
            allowed_users: Vec::new(),
            pool: None,
        }
    }

    pub fn from_config(cfg: &ConfigFile, pool: Option<WorkerPool>) -> Self {
        let analysis = Self::new(cfg.query_definitions(), cfg.analysis.metric_query.clone())
            .allowed_users(cfg.analysis.allowed_users.clone());
        match pool {
            Some(pool) if cfg.analysis.delegate_to_workers => analysis.delegate_to(pool),
            _ => analysis,
        }
    }

    pub fn allowed_users(mut self, users: Vec<String>) -> Self {
        self.allowed_users = users;
        self
    }

    /// Send the metric summary to `pool` and store the worker's results.
    pub fn delegate_to(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    fn metric_summary(&self, queries: &QueryMap) -> MetricAnalysis {
        let processed = queries
            .get(&self.metric_query)
            .and_then(|q| q.processed_result.as_ref());
        match processed {
            Some(ProcessedResult::Metric(metric)) => metric.clone(),
            Some(ProcessedResult::Rows(rows)) => aggregate_metric_rows(rows),
            Some(ProcessedResult::Row(Some(row))) => {
                aggregate_metric_rows(std::slice::from_ref(row))
            }
            Some(ProcessedResult::Row(None)) | None => {
                debug!(query = %self.metric_query, "no metric data; using zeroed summary");
                MetricAnalysis::default()
            }
        }
    }
}

impl Analysis for ConfiguredAnalysis {
    type Params = RunParams;
    type Output = AnalysisOutput;

    fn check_permissions(&self, params: &RunParams) -> Result<()> {
        if self.allowed_users.is_empty() || self.allowed_users.contains(&params.user) {
            Ok(())
        } else {
            Err(StatdagError::PermissionDenied(format!(
                "user '{}' may not run this analysis",
                params.user
            )))
        }
    }

    fn declare_queries(&self, _params: &RunParams) -> Result<Vec<QueryDefinition>> {
        Ok(self.queries.clone())
    }

    fn run_analysis<'a>(
        &'a self,
        _params: &'a RunParams,
        queries: &'a QueryMap,
    ) -> Pin<Box<dyn Future<Output = Result<AnalysisOutput>> + Send + 'a>> {
        Box::pin(async move {
            let metric = self.metric_summary(queries);
            let Some(pool) = &self.pool else {
                return Ok(AnalysisOutput {
                    metric,
                    ..AnalysisOutput::default()
                });
            };

            let request = json!({
                "query": self.metric_query,
                "metric": serde_json::to_value(&metric)?,
            });
            let output = pool.call(request).await?;
            info!(time = output.time, "worker statistics received");
            Ok(AnalysisOutput {
                metric,
                statistics: Some(output.results),
                worker_time: Some(output.time),
            })
        })
    }
}
