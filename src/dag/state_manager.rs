// src/dag/state_manager.rs

//! Per-run state transitions for queries in the scheduler.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::DagGraph;
use crate::dag::query::{Query, QueryName, ScheduledQuery};
use crate::types::QueryStatus;

/// Manages per-run state transitions for queries.
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    queries: &'a mut HashMap<QueryName, Query>,
    run_id: Uuid,
}

impl<'a> StateManager<'a> {
    pub fn new(
        graph: &'a DagGraph,
        queries: &'a mut HashMap<QueryName, Query>,
        run_id: Uuid,
    ) -> Self {
        Self {
            graph,
            queries,
            run_id,
        }
    }

    /// Mark every pending transitive dependent of a failed query as `Error`
    /// without it ever running.
    ///
    /// Returns the names newly marked as failed (excluding `failed_query`).
    pub fn mark_dependents_failed(&mut self, failed_query: &str) -> Vec<QueryName> {
        let mut stack: Vec<(QueryName, QueryName)> = self
            .graph
            .dependents_of(failed_query)
            .iter()
            .map(|d| (d.clone(), failed_query.to_string()))
            .collect();

        let mut newly_failed = Vec::new();

        while let Some((name, upstream)) = stack.pop() {
            let Some(query) = self.queries.get_mut(&name) else {
                warn!(query = %name, "node in DAG not present in query set");
                continue;
            };

            if query.status == QueryStatus::Pending {
                query.status = QueryStatus::Error;
                query.error = Some(format!("skipped: dependency '{upstream}' failed"));
                query.finished_at = Some(Utc::now());
                debug!(
                    query = %query.name,
                    upstream = %upstream,
                    "marking dependent as failed due to upstream failure"
                );
                newly_failed.push(name.clone());
                stack.extend(
                    self.graph
                        .dependents_of(&name)
                        .iter()
                        .map(|d| (d.clone(), name.clone())),
                );
            }
        }

        newly_failed
    }

    /// Collect pending queries whose dependencies are satisfied, mark them
    /// `Running`, and return them in declaration order.
    pub fn collect_new_ready(&mut self) -> Vec<ScheduledQuery> {
        let ro = ReadOnlyStateManager::new(self.graph, self.queries);
        let regular_done = ro.regular_queries_terminal();

        // Decide first, then mutate.
        let candidates: Vec<QueryName> = self
            .graph
            .queries()
            .filter_map(|name| {
                let query = self.queries.get(name)?;
                let ready = query.status == QueryStatus::Pending
                    && (!query.run_at_end || regular_done)
                    && ro.deps_satisfied_for(query);
                ready.then(|| name.to_string())
            })
            .collect();

        let mut ready = Vec::with_capacity(candidates.len());
        for name in candidates {
            if let Some(query) = self.queries.get_mut(&name) {
                info!(
                    query = %query.name,
                    run_id = %self.run_id,
                    query_type = %query.query_type,
                    "dependencies satisfied; dispatching query"
                );
                query.status = QueryStatus::Running;
                query.started_at = Some(Utc::now());
                ready.push(ScheduledQuery::from_query(query, self.run_id));
            }
        }

        ready
    }

    /// Fail any query still pending although nothing can make it runnable.
    pub fn fail_stranded(&mut self) -> Vec<QueryName> {
        let mut stranded = Vec::new();
        for query in self.queries.values_mut() {
            if query.status == QueryStatus::Pending {
                warn!(query = %query.name, "query can never become runnable; failing it");
                query.status = QueryStatus::Error;
                query.error = Some("skipped: dependencies can never be satisfied".to_string());
                query.finished_at = Some(Utc::now());
                stranded.push(query.name.clone());
            }
        }
        stranded
    }
}

/// A read-only view used when only shared access to the query set exists.
pub struct ReadOnlyStateManager<'a> {
    graph: &'a DagGraph,
    queries: &'a HashMap<QueryName, Query>,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(graph: &'a DagGraph, queries: &'a HashMap<QueryName, Query>) -> Self {
        Self { graph, queries }
    }

    /// A query may start only when every dependency has succeeded in this run.
    pub fn deps_satisfied_for(&self, query: &Query) -> bool {
        self.graph.dependencies_of(&query.name).iter().all(|dep| {
            match self.queries.get(dep) {
                Some(d) => d.status == QueryStatus::Success,
                None => {
                    warn!(query = %query.name, dep = %dep, "dependency missing from query set");
                    false
                }
            }
        })
    }

    /// Whether every query not flagged `run_at_end` is terminal.
    pub fn regular_queries_terminal(&self) -> bool {
        self.queries
            .values()
            .filter(|q| !q.run_at_end)
            .all(|q| q.status.is_terminal())
    }
}
