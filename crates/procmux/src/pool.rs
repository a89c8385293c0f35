//! Public facade over the scheduler actor.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use procmux_core::{EndReason, PoolError, PoolEvent, PoolOptions};

use crate::metrics::PoolMetrics;
use crate::scheduler::{PoolCommand, Scheduler};
use crate::task::{QueuedTask, Task};

/// A pool of long-lived worker processes multiplexing text tasks over a
/// stdin/stdout line protocol.
///
/// The pool amortises spawn cost by reusing workers across tasks, bounds
/// fan-out with `max_procs`, recycles workers by task count and age, and
/// surfaces per-task failures without poisoning the rest of the pool.
///
/// Dropping the pool asks the scheduler to drain and shut down; call
/// [`ProcessPool::end`] to wait for that to finish.
pub struct ProcessPool {
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
    events: broadcast::Sender<PoolEvent>,
    metrics: Arc<PoolMetrics>,
    done_rx: watch::Receiver<bool>,
}

impl ProcessPool {
    /// Validate the options, then start the scheduler on the current tokio
    /// runtime.
    ///
    /// `factory` builds the worker command; the pool itself pipes stdio,
    /// isolates the child in its own process group, and spawns it.
    pub fn new(
        options: PoolOptions,
        factory: impl Fn() -> Command + Send + Sync + 'static,
    ) -> Result<Self, PoolError> {
        let options = options.validated()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let (done_tx, done_rx) = watch::channel(false);
        let metrics = Arc::new(PoolMetrics::new());

        let scheduler = Scheduler::new(
            options,
            Box::new(factory),
            cmd_rx,
            worker_tx,
            worker_rx,
            events.clone(),
            metrics.clone(),
            done_tx,
        );
        tokio::spawn(scheduler.run());

        Ok(Self {
            cmd_tx,
            events,
            metrics,
            done_rx,
        })
    }

    /// Append a task to the pending queue and kick the scheduler.
    ///
    /// The task is submitted when this method returns; the returned handle
    /// resolves exactly once with the parser's value or a [`PoolError`].
    /// After [`ProcessPool::end`] the handle resolves immediately with
    /// [`PoolError::Ended`].
    pub fn enqueue<T: Send + 'static>(&self, task: Task<T>) -> TaskHandle<T> {
        if self.metrics.is_ended() {
            return TaskHandle::rejected(PoolError::Ended);
        }
        let (tx, rx) = oneshot::channel();
        let queued = QueuedTask::new(task, tx);
        if self.cmd_tx.send(PoolCommand::Enqueue(queued)).is_err() {
            return TaskHandle::rejected(PoolError::Ended);
        }
        TaskHandle::pending(rx)
    }

    /// PIDs of live workers, after the scheduler has culled dead and aged
    /// ones. Empty once the pool has ended.
    pub async fn pids(&self) -> Vec<u32> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(PoolCommand::Pids(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drain and shut the pool down.
    ///
    /// With `graceful` set, idle workers get the exit command and busy ones
    /// get the graceful window to finish their task before signal
    /// escalation; otherwise everything is killed immediately. Idempotent:
    /// every call waits for the same single shutdown.
    pub async fn end(&self, graceful: bool) {
        let _ = self.cmd_tx.send(PoolCommand::End { graceful });
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Whether the pool is ending or has ended.
    pub fn is_ended(&self) -> bool {
        self.metrics.is_ended()
    }

    /// Subscribe to pool lifecycle events. Slow subscribers may miss events
    /// (the channel is bounded); the scheduler never blocks on them.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Workers spawned over the pool's lifetime. Monotonic.
    pub fn spawned_procs(&self) -> u64 {
        self.metrics.spawned()
    }

    /// Completed tasks (pass or fail marker) per spawned worker.
    pub fn mean_tasks_per_proc(&self) -> f64 {
        let spawned = self.metrics.spawned();
        if spawned == 0 {
            0.0
        } else {
            self.metrics.completed() as f64 / spawned as f64
        }
    }

    /// Unexpected conditions the scheduler has absorbed and reported via
    /// [`PoolEvent::InternalError`].
    pub fn internal_error_count(&self) -> u64 {
        self.metrics.internal_errors()
    }

    /// Tasks waiting for a worker, as of the last scheduler tick.
    pub fn pending_task_count(&self) -> u64 {
        self.metrics.pending()
    }

    /// Workers with a task in flight, as of the last scheduler tick.
    pub fn busy_proc_count(&self) -> u64 {
        self.metrics.busy()
    }

    /// How many workers have left the pool, tallied by reason.
    pub fn end_counts_by_reason(&self) -> BTreeMap<EndReason, u64> {
        self.metrics.end_reasons()
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("spawned_procs", &self.metrics.spawned())
            .field("pending_tasks", &self.metrics.pending())
            .field("ended", &self.metrics.is_ended())
            .finish()
    }
}

/// Future for one enqueued task. The task is already queued when the handle
/// is created; dropping the handle abandons the result but not the task.
pub struct TaskHandle<T> {
    inner: HandleInner<T>,
}

enum HandleInner<T> {
    Pending(oneshot::Receiver<Result<T, PoolError>>),
    Rejected(Option<PoolError>),
}

impl<T> TaskHandle<T> {
    fn pending(rx: oneshot::Receiver<Result<T, PoolError>>) -> Self {
        Self {
            inner: HandleInner::Pending(rx),
        }
    }

    fn rejected(err: PoolError) -> Self {
        Self {
            inner: HandleInner::Rejected(Some(err)),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            HandleInner::Rejected(err) => {
                Poll::Ready(Err(err.take().unwrap_or(PoolError::Ended)))
            }
            HandleInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // The scheduler dropped the task without settling it, which
                // only happens when the pool is torn down.
                Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Ended)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
