// tests/shell_processes.rs

#![cfg(unix)]

mod common;
use crate::common::{TestResult, init_tracing, with_timeout};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use statdag::dag::ScheduledQuery;
use statdag::errors::StatdagError;
use statdag::exec::{CommandQueryExecutor, ExternalIdSink, QueryExecutor};
use statdag::worker::{CommandWorkerFactory, PoolConfig, WorkerPool, WorkerProcess};
use uuid::Uuid;

/// Replies `{"id": <id>, "time": 0, "results": "pong"}` to every request.
const PONG_WORKER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -E 's/.*"id":"([^"]+)".*/\1/')
  echo "diagnostic for $id" >&2
  printf '{"id":"%s","time":0,"results":"pong"}\n' "$id"
done"#;

/// Like `PONG_WORKER`, but writes invalid UTF-8 to both streams and floods
/// stderr past the pipe buffer before every reply.
const NOISY_WORKER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -E 's/.*"id":"([^"]+)".*/\1/')
  printf '\377\376 not protocol\n'
  printf 'bad byte \377\n' >&2
  i=0
  while [ $i -lt 5000 ]; do echo "stderr filler line $i" >&2; i=$((i+1)); done
  printf '{"id":"%s","time":0,"results":"pong"}\n' "$id"
done"#;

fn scheduled(name: &str, statement: &str) -> ScheduledQuery {
    ScheduledQuery {
        name: name.to_string(),
        statement: statement.to_string(),
        query_type: "shell".to_string(),
        run_id: Uuid::new_v4(),
    }
}

fn recording_sink() -> (ExternalIdSink, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink: ExternalIdSink = Arc::new(move |id| sink_seen.lock().unwrap().push(id));
    (sink, seen)
}

#[tokio::test]
async fn command_executor_parses_rows_and_reports_pid() -> TestResult {
    init_tracing();

    let executor = CommandQueryExecutor::new();
    let (sink, seen) = recording_sink();
    let query = scheduled(
        "metric",
        r#"printf '%s\n' "{\"count\": 10, \"query\": \"$STATDAG_QUERY\"}" '{"count": 2}'"#,
    );

    let rows = with_timeout(executor.run(query, sink)).await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["count"], json!(10));
    assert_eq!(rows[0]["query"], json!("metric"));
    let ids = seen.lock().unwrap().clone();
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("pid:"));
    Ok(())
}

#[tokio::test]
async fn command_executor_failure_carries_stderr_tail() -> TestResult {
    init_tracing();

    let executor = CommandQueryExecutor::new();
    let (sink, _) = recording_sink();
    let query = scheduled("broken", "echo 'relation does not exist' >&2; exit 4");

    match with_timeout(executor.run(query, sink)).await {
        Err(StatdagError::QueryFailed { query, message }) => {
            assert_eq!(query, "broken");
            assert!(message.starts_with("exit code 4"));
            assert!(message.contains("relation does not exist"));
        }
        other => panic!("expected QueryFailed, got {other:?}"),
    }

    let (sink, _) = recording_sink();
    let garbage = scheduled("garbage", "echo 'not json'");
    assert!(matches!(
        with_timeout(executor.run(garbage, sink)).await,
        Err(StatdagError::QueryFailed { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn command_executor_survives_invalid_utf8_and_stderr_floods() -> TestResult {
    init_tracing();

    let executor = CommandQueryExecutor::new();
    let (sink, _) = recording_sink();
    let noisy = scheduled(
        "noisy",
        r#"printf 'bad \377 byte\n' >&2
i=0
while [ $i -lt 5000 ]; do echo "progress line $i" >&2; i=$((i+1)); done
echo '{"a": 1}'"#,
    );
    let rows = with_timeout(executor.run(noisy, sink)).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["a"], json!(1));

    let (sink, _) = recording_sink();
    let binary = scheduled("binary", r"printf '\377\n'");
    match with_timeout(executor.run(binary, sink)).await {
        Err(StatdagError::QueryFailed { message, .. }) => {
            assert!(message.starts_with("invalid row output"), "{message}");
        }
        other => panic!("expected QueryFailed, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn command_executor_kills_slow_queries() -> TestResult {
    init_tracing();

    let executor = CommandQueryExecutor::new().with_timeout(Duration::from_millis(100));
    let (sink, _) = recording_sink();
    let result = with_timeout(executor.run(scheduled("slow", "sleep 5"), sink)).await;
    assert!(matches!(result, Err(StatdagError::QueryFailed { ref message, .. }) if message.contains("timed out")));
    Ok(())
}

#[tokio::test]
async fn real_worker_process_round_trip() -> TestResult {
    init_tracing();

    let worker = WorkerProcess::spawn(1, PONG_WORKER, Duration::from_secs(5))?;
    let output = with_timeout(worker.call(json!({ "x": 1 }))).await?;
    assert_eq!(output.results, json!("pong"));
    assert!(worker.is_running());

    worker.destroy();
    with_timeout(async {
        while worker.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(matches!(worker.call(json!(2)).await, Err(StatdagError::WorkerTerminated)));
    Ok(())
}

#[tokio::test]
async fn worker_survives_invalid_utf8_and_stderr_floods() -> TestResult {
    init_tracing();

    let worker = WorkerProcess::spawn(1, NOISY_WORKER, Duration::from_secs(5))?;
    for n in 0..2 {
        let output = with_timeout(worker.call(json!({ "n": n }))).await?;
        assert_eq!(output.results, json!("pong"));
    }
    assert!(worker.is_running());
    assert_eq!(worker.pending_requests(), 0);

    worker.destroy();
    Ok(())
}

#[tokio::test]
async fn crashing_worker_process_rejects_its_call() -> TestResult {
    init_tracing();

    let worker = WorkerProcess::spawn(1, "read line; exit 3", Duration::from_secs(5))?;
    let result = with_timeout(worker.call(json!("boom"))).await;
    assert!(matches!(result, Err(StatdagError::WorkerTerminated)));
    assert!(!worker.is_running());
    Ok(())
}

#[tokio::test]
async fn command_factory_feeds_the_pool() -> TestResult {
    init_tracing();

    let pool = WorkerPool::new(
        PoolConfig {
            min_workers: 1,
            max_workers: 2,
            ..PoolConfig::default()
        },
        CommandWorkerFactory::new(PONG_WORKER),
    );
    pool.init()?;

    let (a, b) = tokio::join!(pool.call(json!(1)), pool.call(json!(2)));
    assert_eq!(a?.results, json!("pong"));
    assert_eq!(b?.results, json!("pong"));
    assert!(pool.stats().live <= 2);

    pool.shutdown().await;
    assert_eq!(pool.stats().live, 0);
    Ok(())
}
