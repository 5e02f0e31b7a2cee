// src/dag/scheduler.rs

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::graph::DagGraph;
use crate::dag::query::{Query, QueryDefinition, QueryName, QueryOutcome};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::StateManager;
use crate::errors::Result;
use crate::types::QueryStatus;

/// Query results keyed by name, handed to the final aggregation step.
pub type QueryMap = BTreeMap<QueryName, Query>;

/// Scheduler holds the immutable query DAG plus the mutable state of one
/// analysis run.
///
/// It is responsible for:
/// - deciding which pending queries are ready (all deps `Success`)
/// - recording executor results through each query's processor
/// - failing dependents when a query fails
/// - reporting when every query is terminal
///
/// Membership is fixed at construction; nothing can be added once dispatch
/// begins.
#[derive(Debug)]
pub struct Scheduler {
    graph: DagGraph,
    queries: HashMap<QueryName, Query>,
    run_id: Uuid,
}

impl Scheduler {
    /// Validate the declared queries and set every one to `Pending`.
    pub fn new(run_id: Uuid, defs: &[QueryDefinition]) -> Result<Self> {
        let graph = DagGraph::from_definitions(defs)?;
        let queries = defs
            .iter()
            .map(|def| (def.name.clone(), Query::from_definition(def)))
            .collect();

        debug!(run_id = %run_id, queries = defs.len(), "scheduler: new analysis run");
        Ok(Self {
            graph,
            queries,
            run_id,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns `true` once every query is `Success` or `Error`.
    pub fn is_finished(&self) -> bool {
        self.queries.values().all(|q| q.status.is_terminal())
    }

    pub fn status_of(&self, query: &str) -> Option<QueryStatus> {
        self.queries.get(query).map(|q| q.status)
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.get(name)
    }

    pub fn dependencies_of(&self, query: &str) -> &[QueryName] {
        self.graph.dependencies_of(query)
    }

    /// Snapshot of every query in declaration order.
    pub fn snapshot(&self) -> Vec<Query> {
        self.graph
            .queries()
            .filter_map(|name| self.queries.get(name).cloned())
            .collect()
    }

    pub fn query_map(&self) -> QueryMap {
        self.queries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Record the executor's external id for a running query.
    pub fn set_external_id(&mut self, query: &str, external_id: String) {
        match self.queries.get_mut(query) {
            Some(q) => {
                debug!(query = %q.name, external_id = %external_id, "recorded external id");
                q.external_id = Some(external_id);
            }
            None => warn!(query = %query, "external id for unknown query; ignoring"),
        }
    }

    /// Start the next wave: every pending query whose dependencies succeeded
    /// is marked `Running` and returned.
    pub fn step_wave(&mut self) -> SchedulerStep {
        let any_running = self
            .queries
            .values()
            .any(|q| q.status == QueryStatus::Running);

        let mut manager = StateManager::new(&self.graph, &mut self.queries, self.run_id);
        let newly_scheduled = manager.collect_new_ready();
        let newly_failed = if newly_scheduled.is_empty() && !any_running {
            manager.fail_stranded()
        } else {
            Vec::new()
        };

        SchedulerStep {
            newly_scheduled,
            newly_failed,
            run_just_finished: self.is_finished(),
        }
    }

    /// Feed one executor result back into the run.
    pub fn step_completion(&mut self, query: &str, outcome: QueryOutcome) -> SchedulerStep {
        let mut newly_failed = Vec::new();

        match self.queries.get_mut(query) {
            Some(q) if q.status == QueryStatus::Running => {
                q.finished_at = Some(Utc::now());
                match outcome {
                    QueryOutcome::Success(rows) => {
                        let processed = q.processor.process(&rows);
                        debug!(query = %q.name, rows = rows.len(), "query succeeded");
                        q.raw_result = Some(rows);
                        q.processed_result = Some(processed);
                        q.status = QueryStatus::Success;
                    }
                    QueryOutcome::Failed(message) => {
                        warn!(
                            query = %q.name,
                            run_id = %self.run_id,
                            error = %message,
                            "query failed; failing dependents in this run"
                        );
                        q.status = QueryStatus::Error;
                        q.error = Some(message);
                        newly_failed.push(q.name.clone());

                        let mut manager =
                            StateManager::new(&self.graph, &mut self.queries, self.run_id);
                        newly_failed.extend(manager.mark_dependents_failed(query));
                    }
                }
            }
            Some(q) => {
                warn!(query = %q.name, status = ?q.status, "completion for query that is not running; ignoring");
            }
            None => warn!(query = %query, "completion for unknown query; ignoring"),
        }

        let run_just_finished = self.is_finished();
        if run_just_finished {
            info!(run_id = %self.run_id, "scheduler: all queries terminal");
        }

        SchedulerStep {
            newly_scheduled: Vec::new(),
            newly_failed,
            run_just_finished,
        }
    }
}
