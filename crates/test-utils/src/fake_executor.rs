use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use statdag::dag::ScheduledQuery;
use statdag::errors::{Result, StatdagError};
use statdag::exec::{ExternalIdSink, QueryExecutor, Row};

#[derive(Debug, Clone, Default)]
struct Script {
    rows: Vec<Row>,
    failure: Option<String>,
    delay: Duration,
    external_id: Option<String>,
}

#[derive(Debug, Default)]
struct Recorded {
    dispatched: Vec<String>,
    completed: Vec<String>,
    running: HashSet<String>,
    max_running: usize,
    /// For each dispatch, the queries that were already running.
    running_at_dispatch: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Default)]
struct State {
    scripts: Mutex<HashMap<String, Script>>,
    recorded: Mutex<Recorded>,
}

/// A fake query executor that:
/// - returns scripted rows (or no rows) after an optional delay
/// - fails scripted queries with a given message
/// - records dispatch / completion order and how many ran at once.
///
/// Clones share state, so a test can keep one clone for assertions.
#[derive(Debug, Clone, Default)]
pub struct FakeQueryExecutor {
    state: Arc<State>,
}

impl FakeQueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, name: &str, f: impl FnOnce(&mut Script)) {
        let mut scripts = self.state.scripts.lock().unwrap();
        f(scripts.entry(name.to_string()).or_default());
    }

    /// Return these rows (JSON objects) for `name`.
    pub fn with_rows(self, name: &str, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .map(|v| v.as_object().cloned().expect("rows must be JSON objects"))
            .collect();
        self.script(name, |s| s.rows = rows);
        self
    }

    pub fn with_failure(self, name: &str, message: &str) -> Self {
        self.script(name, |s| s.failure = Some(message.to_string()));
        self
    }

    pub fn with_delay(self, name: &str, delay: Duration) -> Self {
        self.script(name, |s| s.delay = delay);
        self
    }

    pub fn with_external_id(self, name: &str, external_id: &str) -> Self {
        self.script(name, |s| s.external_id = Some(external_id.to_string()));
        self
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().dispatched.clone()
    }

    pub fn completed(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().completed.clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.recorded.lock().unwrap().max_running
    }

    /// Queries that were still running when `name` was dispatched.
    pub fn running_when_dispatched(&self, name: &str) -> HashSet<String> {
        self.state
            .recorded
            .lock()
            .unwrap()
            .running_at_dispatch
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl QueryExecutor for FakeQueryExecutor {
    fn run(
        &self,
        query: ScheduledQuery,
        set_external_id: ExternalIdSink,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>>> + Send + '_>> {
        Box::pin(async move {
            let script = self
                .state
                .scripts
                .lock()
                .unwrap()
                .get(&query.name)
                .cloned()
                .unwrap_or_default();

            {
                let mut rec = self.state.recorded.lock().unwrap();
                let already = rec.running.clone();
                rec.running_at_dispatch.insert(query.name.clone(), already);
                rec.dispatched.push(query.name.clone());
                rec.running.insert(query.name.clone());
                rec.max_running = rec.max_running.max(rec.running.len());
            }

            if let Some(id) = script.external_id {
                set_external_id(id);
            }
            if !script.delay.is_zero() {
                tokio::time::sleep(script.delay).await;
            }

            {
                let mut rec = self.state.recorded.lock().unwrap();
                rec.running.remove(&query.name);
                rec.completed.push(query.name.clone());
            }

            match script.failure {
                Some(message) => Err(StatdagError::QueryFailed {
                    query: query.name,
                    message,
                }),
                None => Ok(script.rows),
            }
        })
    }
}
