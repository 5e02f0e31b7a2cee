// src/config/validate.rs

use std::sync::LazyLock;

use regex::Regex;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::dag::validate_definitions;
use crate::errors::{Result, StatdagError};

static QUERY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = StatdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.pool, raw.analysis, raw.query))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_queries(cfg)?;
    validate_query_names(cfg)?;
    validate_pool(cfg)?;
    validate_analysis(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_queries(cfg: &RawConfigFile) -> Result<()> {
    if cfg.query.is_empty() {
        return Err(StatdagError::ConfigError(
            "config must contain at least one [query.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_query_names(cfg: &RawConfigFile) -> Result<()> {
    for name in cfg.query.keys() {
        if !QUERY_NAME.is_match(name) {
            return Err(StatdagError::ConfigError(format!(
                "query name '{name}' may only contain letters, digits, '_', '.' and '-'"
            )));
        }
    }
    Ok(())
}

fn validate_pool(cfg: &RawConfigFile) -> Result<()> {
    let Some(pool) = &cfg.pool else {
        return Ok(());
    };

    if pool.command.trim().is_empty() {
        return Err(StatdagError::ConfigError(
            "[pool].command must not be empty".to_string(),
        ));
    }
    if pool.max_workers == 0 {
        return Err(StatdagError::ConfigError(
            "[pool].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if pool.min_workers > pool.max_workers {
        return Err(StatdagError::ConfigError(format!(
            "[pool].min_workers ({}) must not exceed max_workers ({})",
            pool.min_workers, pool.max_workers
        )));
    }
    pool.request_timeout()
        .map_err(|e| StatdagError::ConfigError(format!("[pool].request_timeout: {e}")))?;
    pool.eviction_interval()
        .map_err(|e| StatdagError::ConfigError(format!("[pool].eviction_interval: {e}")))?;
    Ok(())
}

fn validate_analysis(cfg: &RawConfigFile) -> Result<()> {
    if cfg.analysis.entity.trim().is_empty() {
        return Err(StatdagError::ConfigError(
            "[analysis].entity must not be empty".to_string(),
        ));
    }
    if !cfg.query.contains_key(&cfg.analysis.metric_query) {
        return Err(StatdagError::QueryNotFound(format!(
            "[analysis].metric_query '{}' is not a declared query",
            cfg.analysis.metric_query
        )));
    }
    if cfg.analysis.delegate_to_workers && cfg.pool.is_none() {
        return Err(StatdagError::ConfigError(
            "[analysis].delegate_to_workers requires a [pool] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    let defs: Vec<_> = cfg
        .query
        .iter()
        .map(|(name, q)| q.to_definition(name))
        .collect();
    validate_definitions(&defs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    const BASE: &str = r#"
        [analysis]
        entity = "metric_1"
        metric_query = "metric"

        [query.units]
        statement = "select units"

        [query.metric]
        statement = "select metric"
        after = ["units"]
        processor = "metric_stats"
    "#;

    #[test]
    fn accepts_minimal_config_with_defaults() {
        let cfg = parse(BASE).unwrap();
        let defs = cfg.query_definitions();
        assert_eq!(defs.len(), 2);
        let metric = defs.iter().find(|d| d.name == "metric").unwrap();
        assert_eq!(metric.dependencies, vec!["units".to_string()]);
        assert!(metric.required);
        assert_eq!(metric.query_type, "sql");
        assert!(cfg.pool.is_none());
    }

    #[test]
    fn rejects_bad_pool_bounds_and_durations() {
        let too_many_min = format!("{BASE}\n[pool]\ncommand = \"w\"\nmin_workers = 3\nmax_workers = 2\n");
        assert!(matches!(parse(&too_many_min), Err(StatdagError::ConfigError(m)) if m.contains("min_workers")));

        let zero_max = format!("{BASE}\n[pool]\ncommand = \"w\"\nmin_workers = 0\nmax_workers = 0\n");
        assert!(matches!(parse(&zero_max), Err(StatdagError::ConfigError(_))));

        let bad_timeout = format!("{BASE}\n[pool]\ncommand = \"w\"\nrequest_timeout = \"soon\"\n");
        assert!(matches!(parse(&bad_timeout), Err(StatdagError::ConfigError(m)) if m.contains("request_timeout")));
    }

    #[test]
    fn rejects_unknown_metric_query_and_bad_names() {
        let src = BASE.replace("metric_query = \"metric\"", "metric_query = \"nope\"");
        assert!(matches!(parse(&src), Err(StatdagError::QueryNotFound(m)) if m.contains("nope")));

        let src = format!("{BASE}\n[query.\"bad name\"]\nstatement = \"x\"\n");
        assert!(matches!(parse(&src), Err(StatdagError::ConfigError(m)) if m.contains("bad name")));
    }

    #[test]
    fn rejects_cycles() {
        let src = BASE.replace(
            "statement = \"select units\"",
            "statement = \"select units\"\nafter = [\"metric\"]",
        );
        assert!(matches!(parse(&src), Err(StatdagError::DagCycle(_))));
    }
}
