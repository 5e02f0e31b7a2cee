#![allow(dead_code)]

use std::collections::BTreeMap;

use statdag::config::{AnalysisSection, ConfigFile, PoolSection, QueryConfig, RawConfigFile};
use statdag::dag::QueryProcessor;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    /// Start from an analysis of `entity` summarising `metric_query`.
    pub fn new(entity: &str, metric_query: &str) -> Self {
        Self {
            config: RawConfigFile {
                pool: None,
                analysis: AnalysisSection {
                    entity: entity.to_string(),
                    metric_query: metric_query.to_string(),
                    allowed_users: Vec::new(),
                    delegate_to_workers: false,
                },
                query: BTreeMap::new(),
            },
        }
    }

    pub fn with_query(mut self, name: &str, query: QueryConfig) -> Self {
        self.config.query.insert(name.to_string(), query);
        self
    }

    pub fn with_pool(mut self, pool: PoolSection) -> Self {
        self.config.pool = Some(pool);
        self
    }

    pub fn allow_user(mut self, user: &str) -> Self {
        self.config.analysis.allowed_users.push(user.to_string());
        self
    }

    pub fn delegate_to_workers(mut self) -> Self {
        self.config.analysis.delegate_to_workers = true;
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

/// Builder for `QueryConfig`.
pub struct QueryConfigBuilder {
    query: QueryConfig,
}

impl QueryConfigBuilder {
    pub fn new(statement: &str) -> Self {
        Self {
            query: QueryConfig {
                statement: statement.to_string(),
                query_type: "sql".to_string(),
                after: vec![],
                processor: QueryProcessor::Passthrough,
                required: true,
                run_at_end: false,
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.query.after.push(dep.to_string());
        self
    }

    pub fn processor(mut self, processor: QueryProcessor) -> Self {
        self.query.processor = processor;
        self
    }

    pub fn optional(mut self) -> Self {
        self.query.required = false;
        self
    }

    pub fn run_at_end(mut self) -> Self {
        self.query.run_at_end = true;
        self
    }

    pub fn build(self) -> QueryConfig {
        self.query
    }
}
