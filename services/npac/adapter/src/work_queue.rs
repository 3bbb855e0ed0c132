//! Elastic worker pool for deferred adapter work.
//!
//! Retries and reply continuations are queued here and executed in FIFO order
//! by a pool of worker tasks. The pool grows on demand up to `max_threads`
//! workers and shrinks again when more than `max_waiting_threads` workers sit
//! idle. A failing or panicking task is logged and never takes its worker down.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

/// Deferred unit of work
pub type Task = BoxFuture<'static, anyhow::Result<()>>;

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Upper bound on workers
    pub max_threads: usize,
    /// Idle workers kept alive; beyond this idle workers retire
    pub max_waiting_threads: usize,
    /// How long an idle worker waits before re-checking whether to retire
    pub max_wait_time: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            max_threads: 10,
            max_waiting_threads: 10,
            max_wait_time: Duration::from_secs(36_000),
        }
    }
}

struct Job {
    label: String,
    task: Task,
}

struct QueueState {
    jobs: VecDeque<Job>,
    idle: usize,
    // idle workers already notified but not yet awake
    wakeups: usize,
    workers: usize,
    max_waiting: usize,
    alive: bool,
}

struct Shared {
    config: WorkQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    spawned: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkQueueStats {
    /// Tasks waiting for a worker
    pub queued: usize,
    /// Workers waiting for a task
    pub idle: usize,
    /// Workers alive
    pub workers: usize,
    /// Workers ever started
    pub spawned: usize,
    /// Tasks run to completion, failed or not
    pub completed: u64,
    /// Tasks that returned an error or panicked
    pub failed: u64,
}

/// FIFO work queue served by an elastic set of workers
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Create an empty pool; workers start on demand
    pub fn new(config: WorkQueueConfig) -> Self {
        let max_waiting = config.max_waiting_threads;
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    idle: 0,
                    wakeups: 0,
                    workers: 0,
                    max_waiting,
                    alive: true,
                }),
                notify: Notify::new(),
                spawned: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a task; returns false once the pool has been killed
    pub fn enqueue<F>(&self, label: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        let mut state = self.shared.lock();
        if !state.alive {
            warn!("Work queue is shut down, dropping task {}", label);
            return false;
        }
        state.jobs.push_back(Job {
            label,
            task: task.boxed(),
        });

        if state.idle > state.wakeups {
            state.wakeups += 1;
            drop(state);
            self.shared.notify.notify_one();
        } else if state.workers < self.shared.config.max_threads {
            state.workers += 1;
            drop(state);
            self.spawn_worker();
        }
        true
    }

    /// Queue a task once `delay` has elapsed
    pub fn enqueue_after<F>(&self, delay: Duration, label: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        if delay.is_zero() {
            self.enqueue(label, task);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(label, task);
        });
    }

    /// Stop accepting work, drop queued tasks and retire idle workers
    pub fn kill(&self) {
        let dropped = {
            let mut state = self.shared.lock();
            state.alive = false;
            state.max_waiting = 0;
            let dropped = state.jobs.len();
            state.jobs.clear();
            dropped
        };
        if dropped > 0 {
            warn!("Work queue killed with {} queued tasks", dropped);
        }
        self.shared.notify.notify_waiters();
    }

    /// Whether the pool still accepts work
    pub fn is_alive(&self) -> bool {
        self.shared.lock().alive
    }

    /// Current counters
    pub fn stats(&self) -> WorkQueueStats {
        let state = self.shared.lock();
        WorkQueueStats {
            queued: state.jobs.len(),
            idle: state.idle,
            workers: state.workers,
            spawned: self.shared.spawned.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }

    fn spawn_worker(&self) {
        let id = self.shared.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        debug!("Starting work queue worker {}", id);
        tokio::spawn(run_worker(shared, id));
    }
}

async fn run_worker(shared: Arc<Shared>, id: usize) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);

        let job = {
            let mut state = shared.lock();
            if !state.alive {
                state.workers -= 1;
                debug!("Worker {} stopping: queue killed", id);
                return;
            }
            match state.jobs.pop_front() {
                Some(job) => Some(job),
                None if state.idle >= state.max_waiting => {
                    state.workers -= 1;
                    debug!("Worker {} retiring: {} workers already idle", id, state.idle);
                    return;
                }
                None => {
                    state.idle += 1;
                    // register before the lock is released so no wake-up is lost
                    notified.as_mut().enable();
                    None
                }
            }
        };

        match job {
            Some(job) => run_job(&shared, id, job).await,
            None => {
                let woken = timeout(shared.config.max_wait_time, notified).await.is_ok();
                let mut state = shared.lock();
                state.idle -= 1;
                if woken {
                    state.wakeups = state.wakeups.saturating_sub(1);
                }
                state.wakeups = state.wakeups.min(state.idle);
                drop(state);
                if !woken {
                    debug!("Worker {} idle for {:?}", id, shared.config.max_wait_time);
                }
            }
        }
    }
}

async fn run_job(shared: &Shared, id: usize, job: Job) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(job.task).catch_unwind().await;
    shared.completed.fetch_add(1, Ordering::SeqCst);

    match outcome {
        Ok(Ok(())) => debug!(
            "Worker {} finished {} in {:?}",
            id,
            job.label,
            started.elapsed()
        ),
        Ok(Err(e)) => {
            shared.failed.fetch_add(1, Ordering::SeqCst);
            error!("Task {} failed: {:#}", job.label, e);
        }
        Err(panic) => {
            shared.failed.fetch_add(1, Ordering::SeqCst);
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Task {} panicked: {}", job.label, reason);
        }
    }
}

impl fmt::Display for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "Queued tasks [{}] Available workers [{}] Occupied workers [{}]",
            stats.queued,
            stats.idle,
            stats.workers - stats.idle
        )
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
