//! Generic bounded-queue worker pool.
//!
//! N workers pull tasks from one bounded `async_channel` queue. Submitting to
//! a full queue waits for space. Recoverable task errors are counted and
//! reported; the first fatal error cancels the whole pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::ConnectionPool;
use crate::error::{BulkError, ErrorKind, Result};
use crate::events::{EventChannel, PipelineEvent};

/// Processes tasks of one kind. Each worker instance runs on its own task
/// and sees its tasks in dequeue order.
#[async_trait]
pub trait Worker: Send + 'static {
    type Task: Send + 'static;

    /// Process one task.
    async fn process(&mut self, task: Self::Task) -> Result<()>;

    /// Flush per-worker state once the queue is drained.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Identifier reported when a task fails.
    fn label(_task: &Self::Task) -> Option<String> {
        None
    }
}

/// Options of a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub queue_size: usize,
    /// Longest a submission may wait for queue space.
    pub submit_timeout: Option<Duration>,
}

/// Counters of a finished pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub processed: u64,
    pub failed: u64,
}

/// How a pool ended: its counters and the first fatal error, if any.
#[derive(Debug)]
pub struct WorkerPoolReport {
    pub stats: WorkerPoolStats,
    pub fatal: Option<BulkError>,
}

impl WorkerPoolReport {
    pub fn into_result(self) -> Result<WorkerPoolStats> {
        match self.fatal {
            Some(err) => Err(err),
            None => Ok(self.stats),
        }
    }
}

#[derive(Default)]
struct Shared {
    processed: AtomicU64,
    failed: AtomicU64,
    fatal: Mutex<Option<BulkError>>,
}

impl Shared {
    fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn report(&self) -> WorkerPoolReport {
        WorkerPoolReport {
            stats: self.stats(),
            fatal: self.fatal.lock().take(),
        }
    }

    fn record_fatal(&self, err: BulkError, cancel: &CancellationToken) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        cancel.cancel();
    }
}

/// A running pool of workers.
pub struct WorkerPool<W: Worker> {
    tx: async_channel::Sender<W::Task>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    interruptible: Vec<ConnectionPool>,
    options: WorkerPoolOptions,
}

impl<W: Worker> WorkerPool<W> {
    /// Spawn one task per worker.
    pub fn start(
        workers: Vec<W>,
        options: WorkerPoolOptions,
        cancel: CancellationToken,
        events: EventChannel,
    ) -> Self {
        let (tx, rx) = async_channel::bounded::<W::Task>(options.queue_size.max(1));
        let shared = Arc::new(Shared::default());

        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(worker_id, worker)| {
                tokio::spawn(run_worker(
                    worker_id,
                    worker,
                    rx.clone(),
                    cancel.clone(),
                    Arc::clone(&shared),
                    events.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(
            "Started {} workers (queue capacity {})",
            handles.len(),
            options.queue_size.max(1)
        );

        Self {
            tx,
            handles,
            cancel,
            shared,
            interruptible: Vec::new(),
            options,
        }
    }

    /// Statements on this pool's leased connections are interrupted by
    /// [`WorkerPool::shutdown_now`].
    pub fn register_interruptible(&mut self, pool: ConnectionPool) {
        self.interruptible.push(pool);
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stats(&self) -> WorkerPoolStats {
        self.shared.stats()
    }

    /// Whether a worker hit a fatal error.
    pub fn has_failed(&self) -> bool {
        self.shared.fatal.lock().is_some()
    }

    /// Queue a task, waiting while the queue is full.
    pub async fn submit(&self, task: W::Task) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BulkError::Cancelled);
        }

        let send = async {
            match self.options.submit_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.tx.send(task)).await {
                    Ok(sent) => sent.map_err(|_| BulkError::Cancelled),
                    Err(_) => Err(BulkError::capacity(format!(
                        "task queue full for {:?} (capacity {})",
                        limit, self.options.queue_size
                    ))),
                },
                None => self.tx.send(task).await.map_err(|_| BulkError::Cancelled),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BulkError::Cancelled),
            sent = send => sent,
        }
    }

    /// Stop accepting tasks, let workers drain the queue and join them.
    pub async fn close(self) -> WorkerPoolReport {
        self.tx.close();
        let Self {
            handles, shared, ..
        } = self;
        join_workers(handles).await;
        shared.report()
    }

    /// Cancel the pool, interrupt in-flight statements and join the workers.
    pub async fn shutdown_now(self) -> WorkerPoolReport {
        self.cancel.cancel();
        self.tx.close();

        let join = join_workers(self.handles);
        tokio::pin!(join);

        // A statement started after an interrupt is not affected by it, so
        // keep interrupting until every worker has returned.
        loop {
            for pool in &self.interruptible {
                pool.interrupt_all().await;
            }
            tokio::select! {
                _ = &mut join => break,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }

        info!("Worker pool shut down");
        self.shared.report()
    }
}

async fn join_workers(handles: Vec<JoinHandle<()>>) {
    for result in join_all(handles).await {
        if let Err(e) = result {
            error!("Worker task panicked: {}", e);
        }
    }
}

async fn run_worker<W: Worker>(
    worker_id: usize,
    mut worker: W,
    rx: async_channel::Receiver<W::Task>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    events: EventChannel,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Ok(task) => task,
                // Closed and drained
                Err(_) => break,
            },
        };

        let label = W::label(&task);
        match worker.process(task).await {
            Ok(()) => {
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                debug!(worker = worker_id, "Task cancelled");
                break;
            }
            Err(e) if e.is_fatal() => {
                error!(worker = worker_id, "Fatal error: {}", e);
                shared.record_fatal(e, &cancel);
                break;
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = worker_id,
                    "Skipping {}: {}",
                    label.as_deref().unwrap_or("task"),
                    e
                );
                events.publish(PipelineEvent::RecordFailed {
                    external_id: label,
                    kind: e.kind(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if cancel.is_cancelled() {
        debug!(worker = worker_id, "Worker stopped by cancellation");
        return;
    }

    if let Err(e) = worker.finish().await {
        error!(worker = worker_id, "Worker failed to flush: {}", e);
        shared.record_fatal(e, &cancel);
    }
    debug!(worker = worker_id, "Worker finished");
}
