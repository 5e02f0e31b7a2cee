// src/engine/run.rs

//! Persisted analysis run state and the optimistic overlay merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dag::Query;
use crate::errors::{Result, StatdagError};
use crate::types::{AnalysisStatus, QueryStatus};

/// The analysis state stored on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisRun<O> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub status: AnalysisStatus,
    pub run_started: Option<DateTime<Utc>>,
    pub queries: Vec<Query>,
    pub result: Option<O>,
    pub error: Option<String>,
}

impl<O> Default for AnalysisRun<O> {
    fn default() -> Self {
        Self {
            run_id: None,
            status: AnalysisStatus::default(),
            run_started: None,
            queries: Vec::new(),
            result: None,
            error: None,
        }
    }
}

impl<O> AnalysisRun<O> {
    /// Overlay the supplied fields of `update`; everything else is kept.
    ///
    /// A supplied `result` clears `error`. A supplied `error` without a
    /// result clears any previous `result`.
    ///
    /// An update that names a run other than the stored one is refused with
    /// `RunSuperseded` and leaves `self` untouched. Only the write that starts
    /// a run (it carries `run_started`) may replace the stored run id.
    pub fn apply(&mut self, update: AnalysisUpdate<O>) -> Result<()> {
        if let (Some(theirs), Some(ours), None) = (update.run_id, self.run_id, update.run_started) {
            if theirs != ours {
                return Err(StatdagError::RunSuperseded(theirs));
            }
        }

        self.status = update.status;
        self.queries = update.queries;
        if let Some(run_id) = update.run_id {
            self.run_id = Some(run_id);
        }
        if let Some(started) = update.run_started {
            self.run_started = Some(started);
        }
        match (update.result, update.error) {
            (Some(result), _) => {
                self.result = Some(result);
                self.error = None;
            }
            (None, Some(error)) => {
                self.result = None;
                self.error = Some(error);
            }
            (None, None) => {}
        }
        Ok(())
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }
}

/// Partial write of an [`AnalysisRun`]. `status` and `queries` are always
/// written; the optional fields only when present.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisUpdate<O> {
    pub status: AnalysisStatus,
    pub queries: Vec<Query>,
    pub run_id: Option<Uuid>,
    pub run_started: Option<DateTime<Utc>>,
    pub result: Option<O>,
    pub error: Option<String>,
}

impl<O> AnalysisUpdate<O> {
    pub fn new(status: AnalysisStatus, queries: Vec<Query>) -> Self {
        Self {
            status,
            queries,
            run_id: None,
            run_started: None,
            result: None,
            error: None,
        }
    }

    /// Mark this as the write that starts run `run_id`.
    pub fn started(mut self, run_id: Uuid, at: DateTime<Utc>) -> Self {
        self.run_id = Some(run_id);
        self.run_started = Some(at);
        self
    }

    /// Tag a later write of run `run_id`; refused once another run started.
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn result(mut self, result: O) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// An analyzed entity (a metric, an experiment snapshot, ...).
///
/// Attributes other than `id` and `analysis` belong to other writers and are
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "O: serde::de::DeserializeOwned"))]
pub struct Entity<O> {
    pub id: String,
    #[serde(default)]
    pub analysis: AnalysisRun<O>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl<O> Entity<O> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            analysis: AnalysisRun::default(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Overall run status from terminal query states.
///
/// Any failed required query means `Error`; failures limited to optional
/// queries mean `Partial`.
pub fn rollup_status(queries: &[Query]) -> AnalysisStatus {
    let mut optional_failed = false;
    for query in queries {
        if query.status == QueryStatus::Error {
            if query.required {
                return AnalysisStatus::Error;
            }
            optional_failed = true;
        }
    }
    if optional_failed {
        AnalysisStatus::Partial
    } else {
        AnalysisStatus::Success
    }
}

/// The message reported for a run that failed because of its queries: the
/// first required query that failed on its own, else the first skipped one.
pub fn failure_message(queries: &[Query]) -> Option<String> {
    let failed = || {
        queries
            .iter()
            .filter(|q| q.required && q.status == QueryStatus::Error)
    };
    let query = failed()
        .find(|q| !q.error.as_deref().unwrap_or_default().starts_with("skipped:"))
        .or_else(|| failed().next())?;
    Some(format!(
        "required query '{}' failed: {}",
        query.name,
        query.error.as_deref().unwrap_or("unknown error")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::QueryDefinition;
    use serde_json::json;

    fn query(name: &str, required: bool, status: QueryStatus, error: Option<&str>) -> Query {
        let mut def = QueryDefinition::new(name, "select 1");
        if !required {
            def = def.optional();
        }
        let mut q = Query::from_definition(&def);
        q.status = status;
        q.error = error.map(str::to_string);
        q
    }

    #[test]
    fn rollup_distinguishes_required_and_optional_failures() {
        let ok = query("a", true, QueryStatus::Success, None);
        let opt_failed = query("b", false, QueryStatus::Error, Some("x"));
        let req_failed = query("c", true, QueryStatus::Error, Some("y"));

        assert_eq!(rollup_status(&[ok.clone()]), AnalysisStatus::Success);
        assert_eq!(rollup_status(&[ok.clone(), opt_failed.clone()]), AnalysisStatus::Partial);
        assert_eq!(rollup_status(&[ok, opt_failed, req_failed]), AnalysisStatus::Error);
        assert_eq!(rollup_status(&[]), AnalysisStatus::Success);
    }

    #[test]
    fn failure_message_prefers_the_root_cause() {
        let queries = vec![
            query("b", true, QueryStatus::Error, Some("skipped: dependency 'a' failed")),
            query("a", true, QueryStatus::Error, Some("connection refused")),
        ];
        assert_eq!(
            failure_message(&queries).as_deref(),
            Some("required query 'a' failed: connection refused")
        );
        assert_eq!(failure_message(&[]), None);
    }

    #[test]
    fn apply_overlays_only_supplied_fields() {
        let mut run: AnalysisRun<u32> = AnalysisRun {
            error: Some("old failure".into()),
            run_started: Some(Utc::now()),
            ..AnalysisRun::default()
        };
        let started = run.run_started;

        run.apply(AnalysisUpdate::new(AnalysisStatus::Running, vec![])).unwrap();
        assert_eq!(run.status, AnalysisStatus::Running);
        assert_eq!(run.run_started, started);
        assert_eq!(run.error.as_deref(), Some("old failure"));

        run.apply(AnalysisUpdate::new(AnalysisStatus::Success, vec![]).result(7)).unwrap();
        assert_eq!(run.result, Some(7));
        assert_eq!(run.error, None);

        run.apply(AnalysisUpdate::new(AnalysisStatus::Error, vec![]).error("boom")).unwrap();
        assert_eq!(run.result, None);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn writes_from_a_superseded_run_are_refused() {
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        let mut run: AnalysisRun<u32> = AnalysisRun::default();

        run.apply(AnalysisUpdate::new(AnalysisStatus::Queued, vec![]).started(old, Utc::now()))
            .unwrap();
        run.apply(AnalysisUpdate::new(AnalysisStatus::Queued, vec![]).started(new, Utc::now()))
            .unwrap();
        run.apply(AnalysisUpdate::new(AnalysisStatus::Success, vec![]).for_run(new).result(99))
            .unwrap();

        let stale = AnalysisUpdate::new(AnalysisStatus::Success, vec![]).for_run(old).result(1);
        assert!(matches!(run.apply(stale), Err(StatdagError::RunSuperseded(id)) if id == old));
        assert_eq!(run.run_id, Some(new));
        assert_eq!(run.result, Some(99));
    }

    #[test]
    fn entity_keeps_unknown_attributes() {
        let raw = json!({
            "id": "metric_1",
            "owner": "data-team",
            "analysis": { "status": "success", "queries": [], "result": 3 }
        });
        let entity: Entity<u32> = serde_json::from_value(raw).unwrap();
        assert_eq!(entity.attributes.get("owner"), Some(&json!("data-team")));
        assert_eq!(entity.analysis.result, Some(3));

        let back = serde_json::to_value(&entity).unwrap();
        assert_eq!(back["owner"], json!("data-team"));
        assert_eq!(back["analysis"]["status"], json!("success"));
    }
}
