// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dag::{QueryName, QueryOutcome, ScheduledQuery, Scheduler};
use crate::engine::analysis::Analysis;
use crate::engine::run::{AnalysisRun, AnalysisUpdate, failure_message, rollup_status};
use crate::engine::store::ModelStore;
use crate::errors::{Result, StatdagError};
use crate::exec::{ExternalIdSink, QueryExecutor, Row};
use crate::types::AnalysisStatus;

/// Drives one analysis run: dispatches waves of ready queries to the
/// executor, feeds outcomes into the [`Scheduler`], persists progress and
/// finally aggregates.
///
/// The scheduler holds all run semantics; this struct only does the async
/// IO around it.
pub struct RunDriver<A: Analysis, E, S> {
    scheduler: Scheduler,
    entity_id: String,
    params: A::Params,
    analysis: Arc<A>,
    executor: Arc<E>,
    store: Arc<S>,
    superseded: bool,
}

impl<A: Analysis, E, S> fmt::Debug for RunDriver<A, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunDriver")
            .field("scheduler", &self.scheduler)
            .field("entity_id", &self.entity_id)
            .finish_non_exhaustive()
    }
}

impl<A, E, S> RunDriver<A, E, S>
where
    A: Analysis,
    E: QueryExecutor,
    S: ModelStore<A::Output>,
{
    pub fn new(
        scheduler: Scheduler,
        entity_id: String,
        params: A::Params,
        analysis: Arc<A>,
        executor: Arc<E>,
        store: Arc<S>,
    ) -> Self {
        Self {
            scheduler,
            entity_id,
            params,
            analysis,
            executor,
            store,
            superseded: false,
        }
    }

    /// Run every wave to completion and persist the terminal state.
    pub async fn run(mut self) -> Result<AnalysisRun<A::Output>> {
        let run_id = self.scheduler.run_id();
        info!(run_id = %run_id, entity = %self.entity_id, "analysis run started");

        loop {
            let step = self.scheduler.step_wave();
            if !step.newly_failed.is_empty() {
                warn!(failed = ?step.newly_failed, "queries could never run");
            }
            if step.newly_scheduled.is_empty() {
                break;
            }
            self.run_wave(step.newly_scheduled).await;
            if self.superseded {
                return Err(StatdagError::RunSuperseded(run_id));
            }
        }

        self.finish().await
    }

    /// Fire every query of the wave, then apply all outcomes.
    async fn run_wave(&mut self, wave: Vec<ScheduledQuery>) {
        let names: Vec<_> = wave.iter().map(|q| q.name.as_str()).collect();
        debug!(?names, "dispatching wave");

        self.persist_progress().await;
        if self.superseded {
            return;
        }

        let (id_tx, mut id_rx) = mpsc::unbounded_channel::<(QueryName, String)>();
        let executor = Arc::clone(&self.executor);
        let calls = wave.into_iter().map(|query| {
            let name = query.name.clone();
            let tx = id_tx.clone();
            let sink_name = name.clone();
            let sink: ExternalIdSink = Arc::new(move |external_id: String| {
                let _ = tx.send((sink_name.clone(), external_id));
            });
            let executor = Arc::clone(&executor);
            async move {
                let result = executor.run(query, sink).await;
                (name, result)
            }
        });
        let mut all = Box::pin(join_all(calls));
        drop(id_tx);

        let results = loop {
            tokio::select! {
                results = &mut all => break results,
                Some((name, external_id)) = id_rx.recv() => {
                    self.scheduler.set_external_id(&name, external_id);
                    if !self.superseded {
                        self.persist_progress().await;
                    }
                }
            }
        };
        while let Ok((name, external_id)) = id_rx.try_recv() {
            self.scheduler.set_external_id(&name, external_id);
        }

        for (name, result) in results {
            let outcome = outcome_from(&name, result);
            let step = self.scheduler.step_completion(&name, outcome);
            if step.newly_failed.len() > 1 {
                debug!(
                    query = %name,
                    skipped = ?&step.newly_failed[1..],
                    "dependents skipped after failure"
                );
            }
        }
    }

    async fn finish(self) -> Result<AnalysisRun<A::Output>> {
        let run_id = self.scheduler.run_id();
        let queries = self.scheduler.snapshot();
        let status = rollup_status(&queries);

        let update = if status == AnalysisStatus::Error {
            let message = failure_message(&queries)
                .unwrap_or_else(|| "a required query failed".to_string());
            warn!(entity = %self.entity_id, error = %message, "analysis run failed");
            AnalysisUpdate::new(status, queries).for_run(run_id).error(message)
        } else {
            let query_map = self.scheduler.query_map();
            match self.analysis.run_analysis(&self.params, &query_map).await {
                Ok(output) => AnalysisUpdate::new(status, queries)
                    .for_run(run_id)
                    .result(output),
                Err(e) => {
                    error!(entity = %self.entity_id, error = %e, "aggregation failed");
                    AnalysisUpdate::new(AnalysisStatus::Error, queries)
                        .for_run(run_id)
                        .error(format!("analysis failed: {e}"))
                }
            }
        };

        let final_status = update.status;
        let run = persist(self.store.as_ref(), &self.entity_id, update).await?;
        info!(
            run_id = %run_id,
            entity = %self.entity_id,
            status = %final_status,
            "analysis run finished"
        );
        Ok(run)
    }

    /// Best-effort `running` snapshot; a failed write does not stop the run.
    ///
    /// A write refused because a newer run owns the entity marks this run as
    /// superseded: it finishes the current wave and stops without writing.
    async fn persist_progress(&mut self) {
        let run_id = self.scheduler.run_id();
        let update = AnalysisUpdate::new(AnalysisStatus::Running, self.scheduler.snapshot())
            .for_run(run_id);
        match persist(self.store.as_ref(), &self.entity_id, update).await {
            Ok(_) => {}
            Err(StatdagError::RunSuperseded(_)) => {
                warn!(
                    run_id = %run_id,
                    entity = %self.entity_id,
                    "a newer run owns the entity; abandoning this run"
                );
                self.superseded = true;
            }
            Err(e) => {
                warn!(entity = %self.entity_id, error = %e, "failed to persist run progress");
            }
        }
    }
}

/// Re-fetch the entity and overlay `update` onto it.
pub(crate) async fn persist<O, S>(
    store: &S,
    entity_id: &str,
    update: AnalysisUpdate<O>,
) -> Result<AnalysisRun<O>>
where
    S: ModelStore<O> + ?Sized,
{
    let latest = store.get_latest(entity_id).await?;
    let merged = store.update(&latest, update).await?;
    Ok(merged.analysis)
}

fn outcome_from(name: &str, result: Result<Vec<Row>>) -> QueryOutcome {
    match result {
        Ok(rows) => QueryOutcome::Success(rows),
        Err(StatdagError::QueryFailed { message, .. }) => QueryOutcome::Failed(message),
        Err(e) => {
            debug!(query = %name, error = %e, "executor returned error");
            QueryOutcome::Failed(e.to_string())
        }
    }
}
