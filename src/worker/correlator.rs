// src/worker/correlator.rs

//! Request correlation for a single worker process.
//!
//! Every in-flight call registers a pending entry keyed by its correlation
//! id. The entry leaves the pending set exactly once, through one of:
//! - a matching response ([`Correlator::resolve`])
//! - its deadline passing ([`Correlator::expire`], driven by the reaper task)
//! - the worker going away ([`Correlator::fail_all`])
//! - the caller withdrawing it after a failed write ([`Correlator::withdraw`])
//!
//! Deadlines are kept in a min-heap. Entries that were resolved before their
//! deadline leave a stale heap entry behind, which is skipped when popped.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{Result, StatdagError};
use crate::worker::protocol::{WorkerOutput, WorkerResponse};

pub type CallReceiver = oneshot::Receiver<Result<WorkerOutput>>;

struct PendingCall {
    deadline: Instant,
    reply: oneshot::Sender<Result<WorkerOutput>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct DeadlineEntry {
    deadline: Instant,
    id: Uuid,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.id.as_u128().cmp(&other.id.as_u128()))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<Uuid, PendingCall>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
    closed: bool,
}

impl CorrelatorState {
    /// Earliest deadline that still belongs to a pending call.
    fn next_live_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.deadlines.peek() {
            match self.pending.get(&entry.id) {
                Some(call) if call.deadline == entry.deadline => return Some(entry.deadline),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }
}

/// Pending-call table of one worker.
#[derive(Default)]
pub struct Correlator {
    worker_id: u64,
    state: Mutex<CorrelatorState>,
    wake_reaper: Notify,
}

impl Correlator {
    pub fn new(worker_id: u64) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pending call that must be answered before `deadline`.
    ///
    /// Fails with `WorkerTerminated` once the worker has gone away.
    pub fn register(&self, id: Uuid, deadline: Instant) -> Result<CallReceiver> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.state();
            if state.closed {
                return Err(StatdagError::WorkerTerminated);
            }
            state.pending.insert(id, PendingCall { deadline, reply });
            state.deadlines.push(Reverse(DeadlineEntry { deadline, id }));
        }
        self.wake_reaper.notify_one();
        Ok(rx)
    }

    /// Drop a pending call without answering it (e.g. the request could not
    /// be written).
    pub fn withdraw(&self, id: &Uuid) -> bool {
        self.state().pending.remove(id).is_some()
    }

    /// Route a response to its pending call.
    ///
    /// Returns `false` when no call is waiting for this id (already timed out
    /// or never issued); such responses are logged and dropped.
    pub fn resolve(&self, response: WorkerResponse) -> bool {
        let id = response.id;
        let call = self.state().pending.remove(&id);

        match call {
            Some(call) => {
                let outcome = response.into_outcome().map_err(StatdagError::WorkerError);
                if call.reply.send(outcome).is_err() {
                    debug!(worker = self.worker_id, request_id = %id, "caller dropped before response arrived");
                }
                true
            }
            None => {
                warn!(
                    worker = self.worker_id,
                    request_id = %id,
                    "response for unknown or expired request; ignoring"
                );
                false
            }
        }
    }

    /// Reject every call whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<Uuid> {
        let mut expired = Vec::new();
        {
            let mut state = self.state();
            while let Some(deadline) = state.next_live_deadline() {
                if deadline > now {
                    break;
                }
                let Some(Reverse(entry)) = state.deadlines.pop() else {
                    break;
                };
                if let Some(call) = state.pending.remove(&entry.id) {
                    let _ = call
                        .reply
                        .send(Err(StatdagError::WorkerTimeout(entry.id.to_string())));
                    expired.push(entry.id);
                }
            }
        }

        for id in &expired {
            warn!(worker = self.worker_id, request_id = %id, "worker request timed out");
        }
        expired
    }

    /// Reject all pending calls with `WorkerTerminated` and refuse new ones.
    ///
    /// Returns how many calls were rejected. Idempotent.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.state();
            state.closed = true;
            state.deadlines.clear();
            state.pending.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        for call in drained {
            let _ = call.reply.send(Err(StatdagError::WorkerTerminated));
        }
        if count > 0 {
            warn!(worker = self.worker_id, rejected = count, "worker terminated with pending requests");
        }
        self.wake_reaper.notify_one();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.state().pending.contains_key(id)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state().next_live_deadline()
    }

    /// Background loop that evicts timed-out calls until the worker closes.
    pub async fn run_reaper(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                break;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = self.wake_reaper.notified() => {}
                    }
                }
                None => self.wake_reaper.notified().await,
            }
            self.expire(Instant::now());
        }
        debug!(worker = self.worker_id, "timeout reaper finished");
    }
}
