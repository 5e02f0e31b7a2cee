// src/worker/protocol.rs

//! Line-delimited JSON protocol spoken with worker processes.
//!
//! Request (stdin):  `{"id": "<uuid>", "data": <any>}\n`
//! Response (stdout): `{"id": "<uuid>", "time": <seconds>, "results": <any>}\n`
//!                 or `{"id": "<uuid>", "error": "<message>"}\n`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::Result;

/// One request written to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: Uuid,
    pub data: Value,
}

impl WorkerRequest {
    pub fn new(data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
        }
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// One response line read from a worker's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn parse_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Split into the success payload or the worker-reported error.
    pub fn into_outcome(self) -> std::result::Result<WorkerOutput, String> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(WorkerOutput {
                time: self.time.unwrap_or(0.0),
                results: self.results.unwrap_or(Value::Null),
            }),
        }
    }
}

/// Successful result of a worker call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Seconds the worker reported spending on the request.
    pub time: f64,
    pub results: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_line_is_newline_terminated_json() {
        let req = WorkerRequest::new(json!({"metric": [1, 2]}));
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["id"], json!(req.id.to_string()));
        assert_eq!(parsed["data"], json!({"metric": [1, 2]}));
    }

    #[test]
    fn error_field_wins_over_results() {
        let id = Uuid::new_v4();
        let line = format!(r#"{{"id": "{id}", "error": "boom", "results": 1}}"#);
        let resp = WorkerResponse::parse_line(&line).unwrap();
        assert_eq!(resp.into_outcome(), Err("boom".to_string()));
    }

    #[test]
    fn success_response_carries_time_and_results() {
        let id = Uuid::new_v4();
        let line = format!(r#"{{"id": "{id}", "time": 0.25, "results": {{"p": 0.04}}}}"#);
        let out = WorkerResponse::parse_line(&line).unwrap().into_outcome().unwrap();
        assert_eq!(out.time, 0.25);
        assert_eq!(out.results, json!({"p": 0.04}));
    }
}
