// src/worker/pool.rs

//! Bounded pool of worker processes.
//!
//! Checkout is gated by a semaphore with `max_workers` permits: a caller that
//! finds every worker busy waits in the semaphore queue. A new process is only
//! spawned when no idle worker is available, so the number of live workers
//! (idle + checked out) never exceeds `max_workers`. The `min_workers` floor
//! is warmed by [`WorkerPool::init`] and restored lazily on later acquires
//! after the sweeper has evicted dead workers.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::errors::{Result, StatdagError};
use crate::worker::factory::WorkerFactory;
use crate::worker::process::WorkerProcess;
use crate::worker::protocol::WorkerOutput;

/// Pool sizing and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Deadline for a single `call()`.
    pub request_timeout: Duration,
    /// How often idle workers are probed for liveness.
    pub eviction_interval: Duration,
    /// Idle workers probed per sweep.
    pub eviction_sample: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            request_timeout: Duration::from_secs(20),
            eviction_interval: Duration::from_secs(60),
            eviction_sample: 3,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiting: usize,
}

struct PoolInner {
    config: PoolConfig,
    factory: Box<dyn WorkerFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<WorkerProcess>>,
    live: AtomicUsize,
    waiting: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    sweeper: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<WorkerProcess>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn a worker and count it as live. Callers hold the idle lock so that
    /// spawn decisions are serialized.
    fn spawn_worker(&self) -> Result<WorkerProcess> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = self.factory.spawn(id, self.config.request_timeout)?;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(worker = id, live, "worker created");
        Ok(worker)
    }

    fn retire(&self, worker: WorkerProcess) {
        worker.destroy();
        let live = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(worker = worker.id(), live, "worker retired");
    }

    /// Take a live idle worker, or create one if none is idle.
    fn checkout(&self) -> Result<WorkerProcess> {
        let mut idle = self.idle();
        while let Some(worker) = idle.pop_front() {
            if worker.is_running() {
                return Ok(worker);
            }
            debug!(worker = worker.id(), "discarding dead idle worker at checkout");
            self.retire(worker);
        }
        self.spawn_worker()
    }

    fn checkin(&self, worker: WorkerProcess) {
        if self.is_closed() || !worker.is_running() {
            self.retire(worker);
            return;
        }
        self.idle().push_back(worker);
    }

    /// Spawn idle workers until `min_workers` are live.
    fn ensure_min(&self) -> Result<()> {
        let mut idle = self.idle();
        while !self.is_closed() && self.live.load(Ordering::SeqCst) < self.config.min_workers {
            let worker = self.spawn_worker()?;
            idle.push_back(worker);
        }
        Ok(())
    }

    /// Probe up to `sample` idle workers and retire the dead ones.
    fn evict_dead(&self, sample: usize) -> usize {
        let mut idle = self.idle();
        let mut kept = VecDeque::with_capacity(idle.len());
        let mut evicted = 0;
        let mut probed = 0;

        while let Some(worker) = idle.pop_front() {
            if probed < sample {
                probed += 1;
                if !worker.is_running() {
                    warn!(worker = worker.id(), "evicting dead idle worker");
                    self.retire(worker);
                    evicted += 1;
                    continue;
                }
            }
            kept.push_back(worker);
        }
        *idle = kept;
        evicted
    }
}

/// Bounded, explicitly constructed pool of worker processes.
///
/// Cloning is cheap; clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// `max_workers` is at least one and `min_workers` never exceeds it.
    pub fn new(config: PoolConfig, factory: impl WorkerFactory) -> Self {
        let mut config = config;
        config.max_workers = config.max_workers.max(1);
        if config.min_workers > config.max_workers {
            warn!(
                min_workers = config.min_workers,
                max_workers = config.max_workers,
                "min_workers exceeds max_workers; clamping it"
            );
            config.min_workers = config.max_workers;
        }

        let max = config.max_workers;
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Warm `min_workers` processes and start the periodic eviction sweep.
    pub fn init(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(StatdagError::PoolClosed);
        }
        self.inner.ensure_min()?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let period = inner.config.eviction_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = inner.evict_dead(inner.config.eviction_sample);
                        if evicted > 0 {
                            info!(evicted, "eviction sweep removed dead workers");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!("pool sweeper stopped");
        });

        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace((stop_tx, handle));
        if let Some((stop, _)) = previous {
            let _ = stop.send(());
        }

        info!(
            min = self.inner.config.min_workers,
            max = self.inner.config.max_workers,
            "worker pool initialised"
        );
        Ok(())
    }

    /// Check out a live worker, waiting while `max_workers` are busy.
    pub async fn acquire(&self) -> Result<PooledWorker> {
        if self.inner.is_closed() {
            return Err(StatdagError::PoolClosed);
        }

        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner.waiting);
            Arc::clone(&self.inner.permits).acquire_owned().await
        }
        .map_err(|_| StatdagError::PoolClosed)?;

        if self.inner.is_closed() {
            return Err(StatdagError::PoolClosed);
        }

        let worker = self.inner.checkout()?;
        if let Err(e) = self.inner.ensure_min() {
            warn!(error = %e, "failed to restore minimum warm workers");
        }
        debug!(worker = worker.id(), "worker checked out");

        Ok(PooledWorker {
            worker: Some(worker),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Run one request on any available worker.
    pub async fn call(&self, data: Value) -> Result<WorkerOutput> {
        let worker = self.acquire().await?;
        worker.call(data).await
    }

    /// Serialize `input`, run it on a worker, and decode its `results`.
    pub async fn call_typed<I, O>(&self, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let data = serde_json::to_value(input)?;
        let output = self.call(data).await?;
        Ok(serde_json::from_value(output.results)?)
    }

    /// Run one eviction sweep now, probing up to `eviction_sample` idle workers.
    pub fn evict_dead_workers(&self) -> usize {
        self.inner.evict_dead(self.inner.config.eviction_sample)
    }

    pub fn stats(&self) -> PoolStats {
        let live = self.inner.live.load(Ordering::SeqCst);
        let idle = self.inner.idle().len();
        PoolStats {
            live,
            idle,
            busy: live.saturating_sub(idle),
            waiting: self.inner.waiting.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop the sweeper, destroy idle workers and refuse further acquires.
    ///
    /// Workers still checked out are destroyed when they are returned.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((stop, handle)) = sweeper {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "pool sweeper task failed");
            }
        }

        let drained: Vec<WorkerProcess> = self.inner.idle().drain(..).collect();
        let count = drained.len();
        for worker in drained {
            self.inner.retire(worker);
        }
        info!(destroyed = count, "worker pool shut down");
    }
}

/// Counts a caller queued for a permit, including callers whose acquire
/// future is dropped while waiting.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A checked-out worker. Returned to the pool (or retired if dead) on drop.
pub struct PooledWorker {
    worker: Option<WorkerProcess>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledWorker {
    type Target = WorkerProcess;

    fn deref(&self) -> &Self::Target {
        // Only taken in `drop`.
        self.worker.as_ref().unwrap_or_else(|| unreachable!("pooled worker already returned"))
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(worker = worker.id(), "worker checked in");
            self.pool.checkin(worker);
        }
    }
}
