//! Bounded producer/consumer task pools.
//!
//! A [`TaskPool`] runs submitted futures on a fixed number of workers fed by a
//! bounded queue. Tasks may submit further tasks into the same pool (fan-out),
//! so completion is tracked with a pending counter rather than by closing the
//! queue: [`TaskPool::join`] resolves once every submitted task has finished,
//! including tasks enqueued by other tasks.
//!
//! Failures are not returned to the submitter. A task that resolves to `Err`
//! pushes its error into the pool's [`ErrorsQueue`]; once the queue reaches its
//! threshold it cancels the associated stop token, which cooperating tasks are
//! expected to observe at every loop head.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BoxTask<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

/// Pool sizing parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Capacity of the task queue. Submitters block once it fills.
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            // Roomy enough that self-submitting tasks rarely block each other.
            queue_capacity: (workers.max(1) * 64).max(256),
        }
    }
}

/// Errors surfaced by the pool itself (not by tasks).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("task pool `{0}` is closed")]
    Closed(&'static str),
}

/// Shared queue of task errors with a stop threshold.
///
/// `push` stores the error and cancels the stop token once the stored count
/// reaches the threshold. The token is shared with the code that submits
/// tasks, so a single fatal error quiesces the whole pipeline cooperatively.
pub struct ErrorsQueue<E> {
    inner: Arc<ErrorsQueueInner<E>>,
}

struct ErrorsQueueInner<E> {
    errors: Mutex<Vec<E>>,
    threshold: usize,
    stop: CancellationToken,
}

impl<E> Clone for ErrorsQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: std::fmt::Display> ErrorsQueue<E> {
    /// Create a queue that cancels `stop` after `threshold` errors.
    pub fn new(threshold: usize, stop: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ErrorsQueueInner {
                errors: Mutex::new(Vec::new()),
                threshold: threshold.max(1),
                stop,
            }),
        }
    }

    /// Record a task error, cancelling the stop token at the threshold.
    pub fn push(&self, err: E) {
        let mut errors = self.inner.errors.lock();
        warn!(error = %err, "task failed");
        errors.push(err);
        if errors.len() >= self.inner.threshold && !self.inner.stop.is_cancelled() {
            warn!(
                count = errors.len(),
                "error threshold reached, requesting stop"
            );
            self.inner.stop.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.errors.lock().is_empty()
    }

    /// Drain all recorded errors.
    pub fn take_all(&self) -> Vec<E> {
        std::mem::take(&mut *self.inner.errors.lock())
    }
}

/// A fixed-size worker pool fed by a bounded queue.
pub struct TaskPool<E: Send + 'static> {
    shared: Arc<PoolShared<E>>,
    workers: Mutex<Option<JoinSet<()>>>,
}

struct PoolShared<E: Send + 'static> {
    name: &'static str,
    tx: mpsc::Sender<BoxTask<E>>,
    pending: AtomicUsize,
    drained: Notify,
    errors: ErrorsQueue<E>,
    shutdown: CancellationToken,
}

/// Cloneable submission handle, safe to move into tasks running on the pool.
pub struct PoolHandle<E: Send + 'static> {
    shared: Arc<PoolShared<E>>,
}

impl<E: Send + 'static> Clone for PoolHandle<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Send + std::fmt::Display + 'static> TaskPool<E> {
    /// Spawn `config.workers` workers draining the pool queue.
    pub fn new(name: &'static str, config: PoolConfig, errors: ErrorsQueue<E>) -> Self {
        let (tx, rx) = mpsc::channel::<BoxTask<E>>(config.queue_capacity);
        let shared = Arc::new(PoolShared {
            name,
            tx,
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            errors,
            shutdown: CancellationToken::new(),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = JoinSet::new();
        for worker_id in 0..config.workers {
            let shared = shared.clone();
            let rx = rx.clone();
            workers.spawn(async move {
                debug!(pool = shared.name, worker_id, "worker started");
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shared.shutdown.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = task else {
                        break;
                    };
                    if let Err(err) = task.await {
                        shared.errors.push(err);
                    }
                    if shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        shared.drained.notify_waiters();
                    }
                }
                debug!(pool = shared.name, worker_id, "worker stopped");
            });
        }

        Self {
            shared,
            workers: Mutex::new(Some(workers)),
        }
    }

    /// Handle for submitting tasks, including from inside running tasks.
    pub fn handle(&self) -> PoolHandle<E> {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    /// Submit a task. Blocks (asynchronously) while the queue is full.
    pub async fn add_task<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.handle().add_task(task).await
    }

    /// Wait until every submitted task (including fan-out) has completed,
    /// then stop the workers.
    pub async fn join(&self) {
        loop {
            // Register for the notification before checking the counter, so
            // a decrement between the check and the await cannot be missed.
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        self.shared.shutdown.cancel();
        let workers = self.workers.lock().take();
        if let Some(mut workers) = workers {
            while workers.join_next().await.is_some() {}
        }
        debug!(pool = self.shared.name, "pool drained");
    }

    /// Errors recorded by tasks on this pool.
    pub fn errors(&self) -> &ErrorsQueue<E> {
        &self.shared.errors
    }
}

impl<E: Send + std::fmt::Display + 'static> PoolHandle<E> {
    /// Submit a task. Blocks (asynchronously) while the queue is full.
    pub async fn add_task<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.shared.tx.send(Box::pin(task)).await.is_err() {
            if self.shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.shared.drained.notify_waiters();
            }
            return Err(PoolError::Closed(self.shared.name));
        }
        Ok(())
    }
}
