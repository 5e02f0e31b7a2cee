use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use statdag::errors::Result;
use statdag::worker::{WorkerFactory, WorkerProcess};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, duplex};
use tokio::sync::Notify;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Creates in-memory workers that speak the line protocol.
///
/// Each request's `data` is interpreted as a script:
/// - `{"delay_ms": n}` waits `n` ms (virtual time under a paused clock)
/// - `{"fail": "msg"}` answers with an error line
/// - `{"silent": true}` never answers
/// - `{"echo": v}` answers with `results = v`; otherwise `results = data`
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeWorkerFactory {
    spawned: Arc<AtomicUsize>,
    crash_switches: Arc<Mutex<HashMap<u64, Arc<Notify>>>>,
}

impl FakeWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers created so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Make worker `id` exit as if the process died. Returns `false` for an
    /// unknown id.
    pub fn crash(&self, id: u64) -> bool {
        match self.crash_switches.lock().unwrap().get(&id) {
            Some(switch) => {
                switch.notify_one();
                true
            }
            None => false,
        }
    }
}

impl WorkerFactory for FakeWorkerFactory {
    fn spawn(&self, id: u64, request_timeout: Duration) -> Result<WorkerProcess> {
        let (stdin_ours, stdin_theirs) = duplex(PIPE_CAPACITY);
        let (stdout_theirs, stdout_ours) = duplex(PIPE_CAPACITY);

        let crash = Arc::new(Notify::new());
        self.crash_switches
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&crash));
        self.spawned.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(scripted_worker(stdin_theirs, stdout_theirs, crash));
        Ok(WorkerProcess::from_io(id, stdout_ours, stdin_ours, request_timeout))
    }
}

async fn scripted_worker(stdin: DuplexStream, stdout: DuplexStream, crash: Arc<Notify>) {
    let stdout = Arc::new(tokio::sync::Mutex::new(Some(stdout)));
    let mut lines = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = crash.notified() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                tokio::spawn(answer(request, Arc::clone(&stdout)));
            }
        }
    }

    // Dropping the write side is what the orchestrator sees as process exit.
    stdout.lock().await.take();
}

async fn answer(request: Value, stdout: Arc<tokio::sync::Mutex<Option<DuplexStream>>>) {
    let id = request["id"].clone();
    let data = request["data"].clone();

    if let Some(ms) = data.get("delay_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    if data.get("silent").and_then(Value::as_bool) == Some(true) {
        return;
    }

    let response = match data.get("fail").and_then(Value::as_str) {
        Some(message) => json!({ "id": id, "error": message }),
        None => {
            let results = data.get("echo").cloned().unwrap_or(data);
            json!({ "id": id, "time": 0.001, "results": results })
        }
    };

    let mut guard = stdout.lock().await;
    if let Some(out) = guard.as_mut() {
        let line = format!("{response}\n");
        let _ = out.write_all(line.as_bytes()).await;
        let _ = out.flush().await;
    }
}

/// The far end of a worker built by [`manual_worker`]: the test reads
/// requests and writes responses by hand.
pub struct ManualPeer {
    requests: Lines<BufReader<DuplexStream>>,
    responses: Option<DuplexStream>,
}

/// A worker whose responses are fully controlled by the test.
pub fn manual_worker(id: u64, request_timeout: Duration) -> (WorkerProcess, ManualPeer) {
    let (stdin_ours, stdin_theirs) = duplex(PIPE_CAPACITY);
    let (stdout_theirs, stdout_ours) = duplex(PIPE_CAPACITY);
    let worker = WorkerProcess::from_io(id, stdout_ours, stdin_ours, request_timeout);
    let peer = ManualPeer {
        requests: BufReader::new(stdin_theirs).lines(),
        responses: Some(stdout_theirs),
    };
    (worker, peer)
}

impl ManualPeer {
    /// Next request line as JSON (`{"id": .., "data": ..}`).
    pub async fn next_request(&mut self) -> Value {
        let line = self
            .requests
            .next_line()
            .await
            .expect("reading request")
            .expect("worker closed its input");
        serde_json::from_str(&line).expect("request is JSON")
    }

    pub async fn respond(&mut self, id: &Value, results: Value) {
        let line = json!({ "id": id, "time": 0.5, "results": results }).to_string();
        self.respond_raw(&line).await;
    }

    pub async fn respond_error(&mut self, id: &Value, message: &str) {
        let line = json!({ "id": id, "error": message }).to_string();
        self.respond_raw(&line).await;
    }

    /// Write `line` plus a newline to the worker's output stream.
    pub async fn respond_raw(&mut self, line: &str) {
        let out = self.responses.as_mut().expect("peer already closed");
        out.write_all(line.as_bytes()).await.expect("writing response");
        out.write_all(b"\n").await.expect("writing response");
        out.flush().await.expect("flushing response");
    }

    /// Close the output stream, as a process exit would.
    pub fn close(&mut self) {
        self.responses.take();
    }
}
