// src/pool.rs
//
// Bounded worker pool for CPU/IO tasks with a result back-channel. Submission
// never blocks: a saturated buffer is an error the caller handles. The bulk
// result stream is lossy by contract — consumers that need every result use
// `submit_and_wait`, which routes the result through its own channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task queue is full")]
    QueueFull,
    #[error("worker pool is shut down")]
    PoolClosed,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("shutdown timed out")]
    ShutdownTimeout,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("timed out waiting for task result")]
    Timeout,
}

/// Why a task produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    Cancelled,
    Panic(String),
    Failed(String),
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::Cancelled => f.write_str("cancelled"),
            TaskFailure::Panic(msg) => write!(f, "panic: {msg}"),
            TaskFailure::Failed(msg) => f.write_str(msg),
        }
    }
}

pub type TaskJob<T> = Box<dyn FnOnce() -> Result<T, String> + Send + 'static>;

/// A unit of work: identifier, processing closure, optional cancellation
/// flag checked on entry.
pub struct Task<T> {
    pub id: String,
    job: TaskJob<T>,
    cancelled: Option<Arc<AtomicBool>>,
    created_at: Instant,
}

impl<T> Task<T> {
    pub fn new(
        id: impl Into<String>,
        job: impl FnOnce() -> Result<T, String> + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            job: Box::new(job),
            cancelled: None,
            created_at: Instant::now(),
        }
    }

    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(flag);
        self
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[derive(Debug)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub output: Result<T, TaskFailure>,
    pub duration: Duration,
    pub worker: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub workers: usize,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
    pub success_rate: f64,
}

enum WorkItem<T> {
    Bulk(Task<T>),
    Direct(Task<T>, oneshot::Sender<TaskResult<T>>),
}

struct Counters {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct WorkerPool<T: Send + 'static> {
    name: String,
    workers: usize,
    running: AtomicBool,
    counters: Arc<Counters>,
    task_tx: std::sync::Mutex<Option<mpsc::Sender<WorkItem<T>>>>,
    result_rx: std::sync::Mutex<Option<mpsc::Receiver<TaskResult<T>>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn a named pool with `workers` workers (coerced to at least one).
    /// Intake and result buffers are sized `workers * 100`.
    pub fn new(name: impl Into<String>, workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let buffer = workers * 100;

        let (task_tx, task_rx) = mpsc::channel::<WorkItem<T>>(buffer);
        let (result_tx, result_rx) = mpsc::channel::<TaskResult<T>>(buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let counters = Arc::new(Counters {
            active: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let shared_rx = Arc::new(AsyncMutex::new(task_rx));
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = shared_rx.clone();
            let tx = result_tx.clone();
            let counters = counters.clone();
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let item = match item {
                        Some(it) => it,
                        None => break,
                    };
                    match item {
                        WorkItem::Bulk(task) => {
                            let result = execute(worker_id, task, &counters);
                            // Lossy by contract: a full result channel drops
                            // the result rather than stalling the worker.
                            if tx.try_send(result).is_err() {
                                debug!(worker = worker_id, "result channel full, dropping result");
                            }
                        }
                        WorkItem::Direct(task, reply) => {
                            let result = execute(worker_id, task, &counters);
                            let _ = reply.send(result);
                        }
                    }
                }
            }));
        }

        Arc::new(Self {
            name: name.into(),
            workers,
            running: AtomicBool::new(true),
            counters,
            task_tx: std::sync::Mutex::new(Some(task_tx)),
            result_rx: std::sync::Mutex::new(Some(result_rx)),
            shutdown_tx,
            handles: AsyncMutex::new(handles),
        })
    }

    fn send_item(&self, item: WorkItem<T>) -> Result<(), SubmitError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SubmitError::PoolClosed);
        }
        let guard = self.task_tx.lock().expect("task sender lock poisoned");
        let tx = guard.as_ref().ok_or(SubmitError::PoolClosed)?;
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::PoolClosed),
        }
    }

    /// Non-blocking submission into the bulk stream.
    pub fn submit(&self, task: Task<T>) -> Result<(), SubmitError> {
        self.send_item(WorkItem::Bulk(task))
    }

    /// Submit and wait for this task's result on a dedicated channel, with a
    /// per-task timeout. Unaffected by the lossy bulk stream.
    pub async fn submit_and_wait(
        &self,
        task: Task<T>,
        timeout: Duration,
    ) -> Result<TaskResult<T>, WaitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_item(WorkItem::Direct(task, reply_tx))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(WaitError::Submit(SubmitError::PoolClosed)),
            Err(_) => Err(WaitError::Timeout),
        }
    }

    /// Hand out the bulk result stream. Single consumer; callable once.
    pub fn take_results(&self) -> Option<mpsc::Receiver<TaskResult<T>>> {
        self.result_rx.lock().expect("result receiver lock poisoned").take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let total = completed + failed;
        let success_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let pending = {
            let guard = self.task_tx.lock().expect("task sender lock poisoned");
            guard
                .as_ref()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0)
        };
        PoolStats {
            name: self.name.clone(),
            workers: self.workers,
            active: self.counters.active.load(Ordering::Relaxed),
            completed,
            failed,
            pending,
            success_rate,
        }
    }

    fn begin_shutdown(&self) -> bool {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(true);
            // Closing the intake lets workers drain and exit.
            self.task_tx.lock().expect("task sender lock poisoned").take();
            true
        } else {
            false
        }
    }

    /// Stop accepting work, cancel idle workers and wait for all of them.
    pub async fn shutdown(&self) {
        if !self.begin_shutdown() {
            return;
        }
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Like `shutdown`, but gives up after `timeout`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        if !self.begin_shutdown() {
            return Ok(());
        }
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(timeout, join_all)
            .await
            .map_err(|_| PoolError::ShutdownTimeout)
    }
}

/// Run one task inside the panic barrier and account for the outcome.
fn execute<T>(worker: usize, task: Task<T>, counters: &Counters) -> TaskResult<T> {
    counters.active.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();

    let Task { id, job, cancelled, created_at: _ } = task;

    let output = if cancelled.map(|c| c.load(Ordering::Acquire)).unwrap_or(false) {
        Err(TaskFailure::Cancelled)
    } else {
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(TaskFailure::Failed(msg)),
            Err(payload) => Err(TaskFailure::Panic(panic_message(payload))),
        }
    };

    if output.is_ok() {
        counters.completed.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.failed.fetch_add(1, Ordering::Relaxed);
    }
    counters.active.fetch_sub(1, Ordering::Relaxed);

    TaskResult { task_id: id, output, duration: start.elapsed(), worker }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
