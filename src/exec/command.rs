// src/exec/command.rs

//! Shell-command query executor.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dag::ScheduledQuery;
use crate::errors::{Result, StatdagError};
use crate::exec::backend::{ExternalIdSink, QueryExecutor, Row};
use crate::types::decode_line;

/// How many trailing stderr lines are kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Runs each query's statement with `sh -c` and reads rows from stdout.
///
/// The child sees `STATDAG_QUERY`, `STATDAG_QUERY_TYPE` and `STATDAG_RUN_ID`
/// in its environment. Its process id is reported as the external id
/// (`pid:<n>`).
#[derive(Debug, Clone, Default)]
pub struct CommandQueryExecutor {
    timeout: Option<Duration>,
}

impl CommandQueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the child and fail the query if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run_inner(
        &self,
        query: &ScheduledQuery,
        set_external_id: ExternalIdSink,
    ) -> Result<Vec<Row>> {
        info!(
            query = %query.name,
            run_id = %query.run_id,
            query_type = %query.query_type,
            "starting query process"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&query.statement)
            .env("STATDAG_QUERY", &query.name)
            .env("STATDAG_QUERY_TYPE", &query.query_type)
            .env("STATDAG_RUN_ID", query.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for query '{}'", query.name))?;

        if let Some(pid) = child.id() {
            set_external_id(format!("pid:{pid}"));
        }

        let mut stdout = child
            .stdout
            .take()
            .context("query process has no stdout pipe")?;
        let stderr = child.stderr.take();

        // Always consume stderr so buffers don't fill; keep a tail for errors.
        let query_name = query.name.clone();
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let line = decode_line(&buf).into_owned();
                            debug!(query = %query_name, "stderr: {}", line);
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Err(e) => {
                            debug!(query = %query_name, error = %e, "stopped reading stderr");
                            break;
                        }
                    }
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let wait = async {
            let mut bytes = Vec::new();
            stdout
                .read_to_end(&mut bytes)
                .await
                .with_context(|| format!("reading stdout of query '{}'", query.name))?;
            let output = String::from_utf8_lossy(&bytes).into_owned();
            let status = child
                .wait()
                .await
                .with_context(|| format!("waiting for process of query '{}'", query.name))?;
            Ok::<_, StatdagError>((output, status))
        };

        let (output, status) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(query = %query.name, timeout = ?limit, "query process timed out; killing it");
                    stderr_task.abort();
                    return Err(StatdagError::QueryFailed {
                        query: query.name.clone(),
                        message: format!("timed out after {limit:?}"),
                    });
                }
            },
            None => wait.await?,
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();
        let code = status.code().unwrap_or(-1);

        info!(
            query = %query.name,
            run_id = %query.run_id,
            exit_code = code,
            success = status.success(),
            "query process exited"
        );

        if !status.success() {
            let mut message = format!("exit code {code}");
            if !stderr_tail.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr_tail);
            }
            return Err(StatdagError::QueryFailed {
                query: query.name.clone(),
                message,
            });
        }

        parse_rows(&output).map_err(|e| StatdagError::QueryFailed {
            query: query.name.clone(),
            message: format!("invalid row output: {e}"),
        })
    }
}

impl QueryExecutor for CommandQueryExecutor {
    fn run(
        &self,
        query: ScheduledQuery,
        set_external_id: ExternalIdSink,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Row>>> + Send + '_>> {
        Box::pin(async move { self.run_inner(&query, set_external_id).await })
    }
}

/// Parse process output as either a single JSON array of objects or JSON
/// lines with one object per row. Blank output means no rows.
pub fn parse_rows(output: &str) -> Result<Vec<Row>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str::<Row>(line).map_err(StatdagError::from))
        .collect()
}
