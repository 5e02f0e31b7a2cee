// tests/config_errors.rs

mod common;
use crate::common::{TestResult, init_tracing};

use std::io::Write;

use statdag::config::loader::{load_and_validate, load_from_path};
use statdag::dag::QueryProcessor;
use statdag::errors::StatdagError;
use statdag_test_utils::builders::{ConfigFileBuilder, QueryConfigBuilder};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn demo_config_is_valid() -> TestResult {
    init_tracing();

    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/metric.toml");
    let cfg = load_and_validate(path)?;

    assert_eq!(cfg.analysis.entity, "checkout_conversion");
    assert!(cfg.analysis.delegate_to_workers);
    let pool = cfg.pool.as_ref().expect("pool section");
    assert_eq!(pool.pool_config().max_workers, 2);

    let defs = cfg.query_definitions();
    let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["cleanup", "metric", "units"]);
    let cleanup = defs.iter().find(|d| d.name == "cleanup").expect("cleanup");
    assert!(cleanup.run_at_end);
    assert!(!cleanup.required);
    Ok(())
}

#[test]
fn cycle_in_file_is_reported() {
    let file = write_config(
        r#"
        [analysis]
        entity = "m"
        metric_query = "a"

        [query.a]
        statement = "x"
        after = ["b"]

        [query.b]
        statement = "y"
        after = ["a"]
        "#,
    );
    match load_and_validate(file.path()) {
        Err(StatdagError::DagCycle(msg)) => assert!(msg.contains("cycle detected")),
        other => panic!("expected DagCycle, got {other:?}"),
    }
}

#[test]
fn unknown_dependency_and_fields_are_rejected() {
    let file = write_config(
        r#"
        [analysis]
        entity = "m"
        metric_query = "a"

        [query.a]
        statement = "x"
        after = ["ghost"]
        "#,
    );
    assert!(matches!(
        load_and_validate(file.path()),
        Err(StatdagError::ConfigError(msg)) if msg.contains("unknown dependency 'ghost'")
    ));

    let file = write_config(
        r#"
        [analysis]
        entity = "m"
        metric_query = "a"

        [query.a]
        statement = "x"
        retries = 3
        "#,
    );
    assert!(matches!(load_from_path(file.path()), Err(StatdagError::TomlError(_))));
}

#[test]
fn missing_file_is_an_io_error() {
    assert!(matches!(
        load_and_validate("/definitely/not/here/Statdag.toml"),
        Err(StatdagError::IoError(_))
    ));
}

#[test]
fn builder_configs_go_through_the_same_validation() {
    let raw = ConfigFileBuilder::new("m", "metric")
        .with_query("metric", QueryConfigBuilder::new("x").processor(QueryProcessor::MetricStats).build())
        .delegate_to_workers()
        .build_raw();
    assert!(matches!(
        statdag::config::ConfigFile::try_from(raw),
        Err(StatdagError::ConfigError(msg)) if msg.contains("requires a [pool]")
    ));

    let cfg = ConfigFileBuilder::new("m", "metric")
        .with_query("units", QueryConfigBuilder::new("u").build())
        .with_query("metric", QueryConfigBuilder::new("x").after("units").optional().build())
        .allow_user("alice")
        .build();
    assert_eq!(cfg.analysis.allowed_users, vec!["alice".to_string()]);
    assert_eq!(cfg.query_definitions().len(), 2);
}
