// src/exec/mod.rs

//! Query execution layer.
//!
//! The orchestrator hands every dispatched query to a [`QueryExecutor`] and
//! awaits its rows. Production uses [`CommandQueryExecutor`], which runs the
//! query's statement through a shell; tests plug in a fake executor.
//!
//! - [`backend`] defines the `QueryExecutor` trait and the row type.
//! - [`command`] runs queries as child processes that print JSON rows.

pub mod backend;
pub mod command;

pub use backend::{ExternalIdSink, QueryExecutor, Row};
pub use command::{CommandQueryExecutor, parse_rows};
