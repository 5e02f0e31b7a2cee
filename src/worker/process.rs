// src/worker/process.rs

//! A single long-lived worker process and its request/response plumbing.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Result, StatdagError};
use crate::types::decode_line;
use crate::worker::correlator::Correlator;
use crate::worker::protocol::{WorkerOutput, WorkerRequest, WorkerResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to one worker process.
///
/// Output is consumed by a supervisor task that routes responses through the
/// worker's [`Correlator`]; a second task evicts timed-out calls. When the
/// output stream ends (process exit, crash, or [`WorkerProcess::destroy`]) the
/// worker is marked not-alive and every pending call is rejected with
/// `WorkerTerminated`.
pub struct WorkerProcess {
    id: u64,
    stdin: tokio::sync::Mutex<BoxedWriter>,
    correlator: Arc<Correlator>,
    alive: Arc<AtomicBool>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("alive", &self.is_running())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    /// Spawn `command_line` through the platform shell with piped stdio.
    pub fn spawn(id: u64, command_line: &str, request_timeout: Duration) -> Result<Self> {
        info!(worker = id, cmd = %command_line, "spawning worker process");

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command_line);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command_line);
            c
        };

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning worker process '{command_line}'"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StatdagError::WorkerError("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StatdagError::WorkerError("worker stdout not piped".to_string()))?;

        // Diagnostics only; never parsed as protocol data.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) => break,
                        Ok(_) => debug!(worker = id, "stderr: {}", decode_line(&buf)),
                        Err(e) => {
                            debug!(worker = id, error = %e, "stopped reading worker stderr");
                            break;
                        }
                    }
                }
            });
        }

        Ok(Self::attach(id, stdout, stdin, Some(child), request_timeout))
    }

    /// Build a worker over arbitrary byte streams (in-memory transports,
    /// sockets). End-of-stream on `output` counts as process termination.
    pub fn from_io<R, W>(id: u64, output: R, input: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::attach(id, output, input, None, request_timeout)
    }

    fn attach<R, W>(
        id: u64,
        output: R,
        input: W,
        child: Option<Child>,
        request_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let correlator = Arc::new(Correlator::new(id));
        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(supervise(
            id,
            output,
            child,
            Arc::clone(&correlator),
            Arc::clone(&alive),
            kill_rx,
        ));
        tokio::spawn(Arc::clone(&correlator).run_reaper());

        Self {
            id,
            stdin: tokio::sync::Mutex::new(Box::new(input)),
            correlator,
            alive,
            kill: Mutex::new(Some(kill_tx)),
            request_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Liveness probe.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn is_pending(&self, request_id: &Uuid) -> bool {
        self.correlator.is_pending(request_id)
    }

    /// Send `data` to the worker and wait for the correlated response.
    pub async fn call(&self, data: Value) -> Result<WorkerOutput> {
        self.send(WorkerRequest::new(data)).await
    }

    /// Like [`WorkerProcess::call`] but with a caller-built request, so the
    /// correlation id is known up front.
    pub async fn send(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        if !self.is_running() {
            return Err(StatdagError::WorkerTerminated);
        }

        let line = request.to_line()?;
        let deadline = Instant::now() + self.request_timeout;
        let reply = self.correlator.register(request.id, deadline)?;
        debug!(worker = self.id, request_id = %request.id, "sending worker request");

        let written = {
            let mut stdin = self.stdin.lock().await;
            timeout_at(deadline, async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            })
            .await
        };

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.correlator.withdraw(&request.id);
                warn!(worker = self.id, request_id = %request.id, error = %e, "failed to write worker request");
                return Err(StatdagError::WorkerTerminated);
            }
            Err(_elapsed) => {
                self.correlator.withdraw(&request.id);
                return Err(StatdagError::WorkerTimeout(request.id.to_string()));
            }
        }

        match reply.await {
            Ok(result) => result,
            // Reply sender dropped without an answer: the worker went away.
            Err(_) => Err(StatdagError::WorkerTerminated),
        }
    }

    /// Ask the supervisor to kill the process. Pending calls are rejected
    /// with `WorkerTerminated` once the output stream closes.
    pub fn destroy(&self) {
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            debug!(worker = self.id, "destroying worker");
            let _ = sender.send(());
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn supervise<R>(
    id: u64,
    output: R,
    mut child: Option<Child>,
    correlator: Arc<Correlator>,
    alive: Arc<AtomicBool>,
    mut kill_rx: oneshot::Receiver<()>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(output);
    // Kept across iterations: a read interrupted by `kill_rx` leaves its
    // partial line here.
    let mut buf = Vec::new();

    let reason = loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        handle_line(id, &correlator, &decode_line(&buf));
                    }
                    break "output stream closed";
                }
                Ok(_) => {
                    handle_line(id, &correlator, &decode_line(&buf));
                    buf.clear();
                }
                Err(e) => {
                    warn!(worker = id, error = %e, "error reading worker output");
                    break "output stream error";
                }
            },
            _ = &mut kill_rx => break "destroyed",
        }
    };

    alive.store(false, Ordering::SeqCst);
    let rejected = correlator.fail_all();
    info!(worker = id, reason, rejected, "worker stopped");

    if let Some(child) = child.as_mut() {
        if let Err(e) = child.start_kill() {
            debug!(worker = id, error = %e, "worker process already exited");
        }
        match child.wait().await {
            Ok(status) => debug!(worker = id, exit_code = status.code(), "worker process reaped"),
            Err(e) => warn!(worker = id, error = %e, "failed to reap worker process"),
        }
    }
}

fn handle_line(id: u64, correlator: &Correlator, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match WorkerResponse::parse_line(line) {
        Ok(response) => {
            correlator.resolve(response);
        }
        Err(e) => {
            warn!(worker = id, error = %e, "non-protocol line on worker stdout; ignoring");
        }
    }
}
