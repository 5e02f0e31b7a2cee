// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::{QueryDefinition, QueryProcessor};
use crate::types::parse_duration;
use crate::worker::PoolConfig;

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [pool]
/// command = "python3 stats_worker.py"
/// max_workers = 4
///
/// [analysis]
/// entity = "metric_1"
/// metric_query = "metric"
///
/// [query.units]
/// statement = "select ..."
///
/// [query.metric]
/// statement = "select ..."
/// after = ["units"]
/// processor = "metric_stats"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    /// Optional `[pool]` section; without it no worker processes are started.
    #[serde(default)]
    pub pool: Option<PoolSection>,

    pub analysis: AnalysisSection,

    /// All queries from `[query.<name>]`, keyed by name.
    #[serde(default)]
    pub query: BTreeMap<String, QueryConfig>,
}

/// Validated configuration. Only constructed through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub pool: Option<PoolSection>,
    pub analysis: AnalysisSection,
    pub query: BTreeMap<String, QueryConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        pool: Option<PoolSection>,
        analysis: AnalysisSection,
        query: BTreeMap<String, QueryConfig>,
    ) -> Self {
        Self {
            pool,
            analysis,
            query,
        }
    }

    /// Query declarations in name order.
    pub fn query_definitions(&self) -> Vec<QueryDefinition> {
        self.query
            .iter()
            .map(|(name, q)| q.to_definition(name))
            .collect()
    }
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    /// Shell command line that starts one worker process.
    pub command: String,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Duration string, e.g. `"20s"`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: String,

    /// Idle workers probed per eviction sweep.
    #[serde(default = "default_eviction_sample")]
    pub eviction_sample: usize,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    10
}

fn default_request_timeout() -> String {
    "20s".to_string()
}

fn default_eviction_interval() -> String {
    "60s".to_string()
}

fn default_eviction_sample() -> usize {
    3
}

impl PoolSection {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            request_timeout: default_request_timeout(),
            eviction_interval: default_eviction_interval(),
            eviction_sample: default_eviction_sample(),
        }
    }

    pub fn request_timeout(&self) -> Result<Duration, String> {
        parse_duration(&self.request_timeout)
    }

    pub fn eviction_interval(&self) -> Result<Duration, String> {
        parse_duration(&self.eviction_interval)
    }

    /// Runtime pool settings. Durations that fail to parse fall back to the
    /// defaults; validation rejects them before this is reachable.
    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            request_timeout: self.request_timeout().unwrap_or(defaults.request_timeout),
            eviction_interval: self
                .eviction_interval()
                .unwrap_or(defaults.eviction_interval),
            eviction_sample: self.eviction_sample,
        }
    }
}

/// `[analysis]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisSection {
    /// Id of the analyzed entity in the model store.
    pub entity: String,

    /// Query whose processed rows feed the metric summary.
    pub metric_query: String,

    /// Users allowed to start a run. Empty means anyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Send the summary to the worker pool for further statistics.
    #[serde(default)]
    pub delegate_to_workers: bool,
}

/// `[query.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Opaque payload handed to the executor.
    pub statement: String,

    #[serde(default = "default_query_type")]
    pub query_type: String,

    /// Dependency list: this query waits for all queries listed here.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub processor: QueryProcessor,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default)]
    pub run_at_end: bool,
}

fn default_query_type() -> String {
    "sql".to_string()
}

fn default_required() -> bool {
    true
}

impl QueryConfig {
    pub fn to_definition(&self, name: &str) -> QueryDefinition {
        QueryDefinition {
            name: name.to_string(),
            statement: self.statement.clone(),
            query_type: self.query_type.clone(),
            dependencies: self.after.clone(),
            processor: self.processor,
            required: self.required,
            run_at_end: self.run_at_end,
        }
    }
}
