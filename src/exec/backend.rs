// src/exec/backend.rs

//! Pluggable query executor abstraction.
//!
//! The orchestrator talks to a `QueryExecutor` instead of a concrete
//! database client. This makes it easy to swap in a fake executor in tests
//! while keeping the production implementation in [`super::command`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::dag::ScheduledQuery;
use crate::errors::Result;

/// One result row: column name to JSON value.
pub type Row = Map<String, Value>;

/// Callback an executor uses to report the external id of a started query
/// (a job id, a process id, ...). It may be called at most once per query,
/// before the result future resolves.
pub type ExternalIdSink = Arc<dyn Fn(String) + Send + Sync>;

/// Trait abstracting how dispatched queries are executed.
///
/// Implementations must be shareable across concurrently running queries of
/// the same wave.
pub trait QueryExecutor: Send + Sync + 'static {
    /// Run a single query and return its raw rows.
    ///
    /// An `Err` marks the query as failed; the error's message is stored on
    /// the query.
    fn run(
        &self,
        query: ScheduledQuery,
        set_external_id: ExternalIdSink,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>>> + Send + '_>>;
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for Arc<T> {
    fn run(
        &self,
        query: ScheduledQuery,
        set_external_id: ExternalIdSink,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>>> + Send + '_>> {
        (**self).run(query, set_external_id)
    }
}
