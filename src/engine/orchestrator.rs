// src/engine/orchestrator.rs

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::{Query, Scheduler};
use crate::engine::analysis::Analysis;
use crate::engine::run::{AnalysisRun, AnalysisUpdate};
use crate::engine::runtime::{RunDriver, persist};
use crate::engine::store::ModelStore;
use crate::errors::{Result, StatdagError};
use crate::exec::QueryExecutor;
use crate::types::{AnalysisStatus, QueryStatus};

/// Starts analysis runs against one analysis, executor and model store.
pub struct Orchestrator<A, E, S> {
    analysis: Arc<A>,
    executor: Arc<E>,
    store: Arc<S>,
}

impl<A, E, S> Clone for Orchestrator<A, E, S> {
    fn clone(&self) -> Self {
        Self {
            analysis: Arc::clone(&self.analysis),
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
        }
    }
}

/// A run that has been declared, persisted as `queued` and is now being
/// driven in the background.
#[derive(Debug)]
pub struct RunHandle<O> {
    pub run_id: Uuid,
    pub entity_id: String,
    /// The declared queries, all `pending`, in declaration order.
    pub queries: Vec<Query>,
    handle: JoinHandle<Result<AnalysisRun<O>>>,
}

impl<O> RunHandle<O> {
    /// Wait for the run to reach a terminal status.
    pub async fn wait(mut self) -> Result<AnalysisRun<O>> {
        self.join().await
    }

    /// Like [`RunHandle::wait`] but borrows the handle, so it can sit in a
    /// `select!` and the run can still be interrupted if another branch wins.
    pub async fn join(&mut self) -> Result<AnalysisRun<O>> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(StatdagError::Other(anyhow::anyhow!(
                "analysis run {} aborted: {e}",
                self.run_id
            ))),
        }
    }
}

impl<A, E, S> Orchestrator<A, E, S>
where
    A: Analysis,
    E: QueryExecutor,
    S: ModelStore<A::Output>,
{
    pub fn new(analysis: A, executor: E, store: S) -> Self {
        Self {
            analysis: Arc::new(analysis),
            executor: Arc::new(executor),
            store: Arc::new(store),
        }
    }

    /// Declare the queries of a new run on `entity_id` and begin dispatch.
    ///
    /// Nothing is persisted unless the permission check passes and the
    /// declared DAG is valid.
    pub async fn start_queries(
        &self,
        entity_id: &str,
        params: A::Params,
    ) -> Result<RunHandle<A::Output>> {
        if let Err(e) = self.analysis.check_permissions(&params) {
            warn!(entity = %entity_id, error = %e, "analysis refused");
            return Err(e);
        }

        let defs = self.analysis.declare_queries(&params)?;
        let run_id = Uuid::new_v4();
        let scheduler = Scheduler::new(run_id, &defs)?;
        let queries = scheduler.snapshot();

        let update = AnalysisUpdate::new(AnalysisStatus::Queued, queries.clone())
            .started(run_id, Utc::now());
        persist(self.store.as_ref(), entity_id, update).await?;
        debug!(run_id = %run_id, entity = %entity_id, queries = queries.len(), "run queued");

        let driver = RunDriver::new(
            scheduler,
            entity_id.to_string(),
            params,
            Arc::clone(&self.analysis),
            Arc::clone(&self.executor),
            Arc::clone(&self.store),
        );
        let handle = tokio::spawn(driver.run());

        info!(run_id = %run_id, entity = %entity_id, "analysis run dispatched");
        Ok(RunHandle {
            run_id,
            entity_id: entity_id.to_string(),
            queries,
            handle,
        })
    }

    /// Stop a run before it finishes and persist it as `error`.
    ///
    /// The driver task is aborted, which drops in-flight executor calls (the
    /// command executor kills its children on drop). Queries that had not
    /// reached a terminal status are marked `error` with `reason`. If the run
    /// had already finished, its own terminal state is returned unchanged.
    pub async fn interrupt(
        &self,
        handle: RunHandle<A::Output>,
        reason: &str,
    ) -> Result<AnalysisRun<A::Output>> {
        let RunHandle {
            run_id,
            entity_id,
            handle,
            ..
        } = handle;

        handle.abort();
        match handle.await {
            Ok(finished) => return finished,
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                return Err(StatdagError::Other(anyhow::anyhow!(
                    "analysis run {run_id} aborted: {e}"
                )));
            }
        }
        warn!(run_id = %run_id, entity = %entity_id, reason, "analysis run interrupted");

        let latest = self.store.get_latest(&entity_id).await?;
        let now = Utc::now();
        let queries = latest
            .analysis
            .queries
            .into_iter()
            .map(|mut query| {
                if !query.status.is_terminal() {
                    query.status = QueryStatus::Error;
                    query.error = Some(reason.to_string());
                    query.finished_at = Some(now);
                }
                query
            })
            .collect();

        let update = AnalysisUpdate::new(AnalysisStatus::Error, queries)
            .for_run(run_id)
            .error(reason);
        persist(self.store.as_ref(), &entity_id, update).await
    }

    /// Start a run and wait for its terminal state.
    pub async fn analyze(
        &self,
        entity_id: &str,
        params: A::Params,
    ) -> Result<AnalysisRun<A::Output>> {
        self.start_queries(entity_id, params).await?.wait().await
    }
}
