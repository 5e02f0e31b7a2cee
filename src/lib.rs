// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod stats;
pub mod types;
pub mod worker;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::engine::{ConfiguredAnalysis, JsonFileModelStore, Orchestrator, RunParams};
use crate::exec::CommandQueryExecutor;
use crate::types::AnalysisStatus;
use crate::worker::{CommandWorkerFactory, WorkerPool};

const INTERRUPTED_MESSAGE: &str = "interrupted before the analysis finished";

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the optional worker pool
/// - the JSON model store
/// - the orchestrator with the shell query executor
/// - Ctrl-C handling
///
/// The final analysis run is printed to stdout as JSON.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let pool = match &cfg.pool {
        Some(section) => {
            let pool = WorkerPool::new(
                section.pool_config(),
                CommandWorkerFactory::new(section.command.clone()),
            );
            pool.init()?;
            Some(pool)
        }
        None => None,
    };

    let store = JsonFileModelStore::new(&args.store);
    store.ensure_entity(&cfg.analysis.entity).await?;
    debug!(store = %store.dir().display(), entity = %cfg.analysis.entity, "model store ready");

    let analysis = ConfiguredAnalysis::from_config(&cfg, pool.clone());
    let orchestrator = Orchestrator::new(analysis, CommandQueryExecutor::new(), store);
    let params = RunParams::new(args.user.clone());

    let mut handle = orchestrator
        .start_queries(&cfg.analysis.entity, params)
        .await?;

    // A failed signal listener disables its branch; the run then just finishes.
    let finished = tokio::select! {
        res = handle.join() => Some(res),
        Ok(()) = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(res) => res,
        None => {
            warn!("received Ctrl+C; stopping the analysis run");
            orchestrator
                .interrupt(handle, INTERRUPTED_MESSAGE)
                .await
        }
    };

    if let Some(pool) = &pool {
        pool.shutdown().await;
    }

    let run = outcome?;
    println!("{}", serde_json::to_string_pretty(&run)?);

    match run.status {
        AnalysisStatus::Error => bail!(
            "analysis finished with status error: {}",
            run.error.as_deref().unwrap_or("unknown error")
        ),
        AnalysisStatus::Partial => {
            warn!("analysis finished with optional query failures");
            Ok(())
        }
        status => {
            info!(%status, "analysis finished");
            Ok(())
        }
    }
}

/// Simple dry-run output: print queries, deps and statements.
fn print_dry_run(cfg: &ConfigFile) {
    println!("statdag dry-run");
    println!("  analysis.entity = {}", cfg.analysis.entity);
    println!("  analysis.metric_query = {}", cfg.analysis.metric_query);
    match &cfg.pool {
        Some(pool) => println!(
            "  pool = {} (min {}, max {}, timeout {})",
            pool.command, pool.min_workers, pool.max_workers, pool.request_timeout
        ),
        None => println!("  pool = none"),
    }
    println!();

    println!("queries ({}):", cfg.query.len());
    for (name, query) in cfg.query.iter() {
        println!("  - {name} [{}]", query.query_type);
        println!("      statement: {}", query.statement);
        if !query.after.is_empty() {
            println!("      after: {:?}", query.after);
        }
        println!("      processor: {:?}", query.processor);
        if !query.required {
            println!("      required: false");
        }
        if query.run_at_end {
            println!("      run_at_end: true");
        }
    }

    debug!("dry-run complete (no execution)");
}
