//! Patch application on a dedicated worker thread.
//!
//! ```text
//!  apply_async ──Job{id, tree, ops}──▸ [canopy-patch thread] ──▸ executor
//!       ▲                                      │
//!       └──── oneshot (keyed by job id) ◂──────┘
//!
//!  timeout / crash / no thread ──▸ canopy_core::apply on the caller
//! ```
//!
//! The caller never sees a worker failure: every path ends in a tree. A
//! worker that timed out or panicked is retired and a new one is spawned
//! lazily on the next call. A wedged thread cannot be killed; it is
//! detached and exits once it returns and finds its job queue closed.

use canopy_core::{PatchOp, UiNode};
use serde::Deserialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "canopy-patch";

/// Offload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Use a worker thread at all. `false` applies every batch on the caller.
    pub enabled: bool,
    /// How long a job may take before the caller computes it itself.
    pub timeout_ms: u64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 10_000,
        }
    }
}

impl OffloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Worker failures. Handled internally; `apply_async` always falls back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker crashed: {0}")]
    Crashed(String),
    #[error("No worker available")]
    Unavailable,
    #[error("Worker disconnected")]
    Disconnected,
    #[error("Worker did not reply within {0:?}")]
    TimedOut(Duration),
}

/// What the worker runs for each job.
pub trait PatchExecutor: Send + Sync + 'static {
    fn execute(&self, tree: &Arc<UiNode>, ops: &[PatchOp]) -> Arc<UiNode>;
}

/// Runs the patch engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineExecutor;

impl PatchExecutor for EngineExecutor {
    fn execute(&self, tree: &Arc<UiNode>, ops: &[PatchOp]) -> Arc<UiNode> {
        canopy_core::apply(tree, ops)
    }
}

/// Counters for observing offload behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub jobs_dispatched: u64,
    pub fallbacks: u64,
    pub workers_spawned: u64,
    pub timeouts: u64,
    pub crashes: u64,
}

type Reply = oneshot::Sender<Result<Arc<UiNode>, WorkerError>>;
type Pending = Arc<Mutex<HashMap<u64, Reply>>>;

struct Job {
    id: u64,
    tree: Arc<UiNode>,
    ops: Vec<PatchOp>,
}

/// Handle to one live worker thread.
struct Worker {
    generation: u64,
    jobs: std_mpsc::Sender<Job>,
    pending: Pending,
}

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, Reply>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Worker {
    fn spawn(generation: u64, executor: Arc<dyn PatchExecutor>) -> Result<Self, WorkerError> {
        let (jobs, job_rx) = std_mpsc::channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let thread_pending = pending.clone();

        std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(generation, job_rx, thread_pending, executor))
            .map_err(|e| {
                log::warn!("Failed to spawn patch worker: {e}");
                WorkerError::Unavailable
            })?;

        Ok(Self {
            generation,
            jobs,
            pending,
        })
    }
}

fn run_worker(
    generation: u64,
    jobs: std_mpsc::Receiver<Job>,
    pending: Pending,
    executor: Arc<dyn PatchExecutor>,
) {
    log::debug!("Patch worker #{generation} started");

    while let Ok(job) = jobs.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&job.tree, &job.ops)));
        match outcome {
            Ok(tree) => {
                // Absent when the caller already gave up on this job.
                if let Some(reply) = lock(&pending).remove(&job.id) {
                    let _ = reply.send(Ok(tree));
                }
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                log::warn!("Patch worker #{generation} crashed on job {}: {reason}", job.id);
                for (_, reply) in lock(&pending).drain() {
                    let _ = reply.send(Err(WorkerError::Crashed(reason.clone())));
                }
                return;
            }
        }
    }

    log::debug!("Patch worker #{generation} stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Applies patch batches off the async runtime with a bounded wait.
pub struct PatchOffloader {
    config: OffloadConfig,
    executor: Arc<dyn PatchExecutor>,
    worker: Option<Worker>,
    next_job: u64,
    generations: u64,
    stats: OffloadStats,
}

impl PatchOffloader {
    pub fn new(config: OffloadConfig) -> Self {
        Self::with_executor(config, Arc::new(EngineExecutor))
    }

    /// Use a custom executor on the worker. The caller-side fallback always
    /// runs the patch engine directly.
    pub fn with_executor(config: OffloadConfig, executor: Arc<dyn PatchExecutor>) -> Self {
        Self {
            config,
            executor,
            worker: None,
            next_job: 1,
            generations: 0,
            stats: OffloadStats::default(),
        }
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    /// Whether a worker thread is currently attached.
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Apply `ops` to `tree`. Resolves with a tree on every path.
    pub async fn apply_async(&mut self, tree: &Arc<UiNode>, ops: &[PatchOp]) -> Arc<UiNode> {
        if ops.is_empty() {
            return tree.clone();
        }

        match self.submit(tree, ops).await {
            Ok(next) => next,
            Err(e) => {
                if e != WorkerError::Unavailable || self.config.enabled {
                    log::warn!("Offloaded patch failed ({e}), applying on caller");
                }
                self.stats.fallbacks += 1;
                canopy_core::apply(tree, ops)
            }
        }
    }

    async fn submit(&mut self, tree: &Arc<UiNode>, ops: &[PatchOp]) -> Result<Arc<UiNode>, WorkerError> {
        if !self.config.enabled {
            return Err(WorkerError::Unavailable);
        }

        let timeout = self.config.timeout();
        let id = self.next_job;
        self.next_job += 1;

        let worker = self.ensure_worker()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&worker.pending).insert(id, reply_tx);

        let job = Job {
            id,
            tree: tree.clone(),
            ops: ops.to_vec(),
        };
        if worker.jobs.send(job).is_err() {
            lock(&worker.pending).remove(&id);
            self.retire_worker("job queue closed");
            return Err(WorkerError::Disconnected);
        }
        self.stats.jobs_dispatched += 1;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(next))) => Ok(next),
            Ok(Ok(Err(e))) => {
                self.stats.crashes += 1;
                self.retire_worker("crashed");
                Err(e)
            }
            Ok(Err(_)) => {
                self.retire_worker("reply dropped");
                Err(WorkerError::Disconnected)
            }
            Err(_) => {
                if let Some(worker) = &self.worker {
                    lock(&worker.pending).remove(&id);
                }
                self.stats.timeouts += 1;
                self.retire_worker("timed out");
                Err(WorkerError::TimedOut(timeout))
            }
        }
    }

    fn ensure_worker(&mut self) -> Result<&Worker, WorkerError> {
        if self.worker.is_none() {
            self.generations += 1;
            let worker = Worker::spawn(self.generations, self.executor.clone())?;
            self.stats.workers_spawned += 1;
            self.worker = Some(worker);
        }
        self.worker.as_ref().ok_or(WorkerError::Unavailable)
    }

    /// Detach the current worker; dropping its queue lets the thread exit.
    fn retire_worker(&mut self, reason: &str) {
        if let Some(worker) = self.worker.take() {
            log::warn!("Retiring patch worker #{} ({reason})", worker.generation);
        }
    }
}
