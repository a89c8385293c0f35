//! The scheduler actor: owns the pool, the pending queue, and every state
//! transition.
//!
//! All mutation happens on this one task. Reader pumps feed framed lines and
//! exit notices in through an mpsc channel; the facade sends commands through
//! another. Age, spawn, task, and shutdown timers are absolute deadlines
//! checked during the tick rather than timer callbacks, so no transition can
//! race another.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use procmux_core::{EndReason, PoolError, PoolEvent, PoolOptions};
use procmux_process::{
    ChildHandle, ChildState, LineOutcome, StreamSource, TaskCompletion, WorkerMsg,
    spawn_output_pump, spawn_worker,
};

use crate::failure_window::FailureWindow;
use crate::metrics::PoolMetrics;
use crate::task::{QueuedTask, TaskOutcome};

const FAILURE_WINDOW: Duration = Duration::from_secs(60);

pub(crate) type Factory = Box<dyn Fn() -> Command + Send + Sync>;

/// Commands from the facade to the scheduler.
pub(crate) enum PoolCommand {
    Enqueue(QueuedTask),
    Pids(oneshot::Sender<Vec<u32>>),
    End { graceful: bool },
}

/// One pool slot: the protocol handle plus the task it is running.
struct Worker {
    handle: ChildHandle,
    current: Option<QueuedTask>,
    end_reason: Option<EndReason>,
    /// Deadline for a busy worker to finish its task during shutdown.
    shutdown_deadline: Option<Instant>,
}

pub(crate) struct Scheduler {
    opts: PoolOptions,
    factory: Factory,
    cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
    worker_rx: mpsc::UnboundedReceiver<WorkerMsg>,
    events: broadcast::Sender<PoolEvent>,
    metrics: Arc<PoolMetrics>,
    queue: VecDeque<QueuedTask>,
    workers: Vec<Worker>,
    failures: FailureWindow,
    pid_queries: Vec<oneshot::Sender<Vec<u32>>>,
    ending: bool,
    graceful: bool,
    breaker_tripped: bool,
    done_tx: watch::Sender<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        opts: PoolOptions,
        factory: Factory,
        cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
        worker_tx: mpsc::UnboundedSender<WorkerMsg>,
        worker_rx: mpsc::UnboundedReceiver<WorkerMsg>,
        events: broadcast::Sender<PoolEvent>,
        metrics: Arc<PoolMetrics>,
        done_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            opts,
            factory,
            cmd_rx,
            worker_tx,
            worker_rx,
            events,
            metrics,
            queue: VecDeque::new(),
            workers: Vec::new(),
            failures: FailureWindow::new(FAILURE_WINDOW),
            pid_queries: Vec::new(),
            ending: false,
            graceful: true,
            breaker_tripped: false,
            done_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(
            self.opts.on_idle_interval_millis.max(1),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cmd_open = true;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv(), if cmd_open => match cmd {
                    Some(PoolCommand::Enqueue(task)) => self.on_enqueue(task),
                    Some(PoolCommand::Pids(reply)) => self.pid_queries.push(reply),
                    Some(PoolCommand::End { graceful }) => self.begin_end(graceful).await,
                    None => {
                        // Facade dropped: drain and shut down.
                        cmd_open = false;
                        self.begin_end(true).await;
                    }
                },
                msg = self.worker_rx.recv() => {
                    if let Some(msg) = msg {
                        self.on_worker_msg(msg);
                    }
                }
                _ = tick.tick() => {}
            }

            self.tick().await;

            if self.ending && self.workers.is_empty() && self.queue.is_empty() {
                break;
            }
        }

        if self.opts.stream_flush_millis > 0 {
            tokio::time::sleep(self.opts.stream_flush()).await;
        }
        self.answer_pid_queries();
        self.update_gauges();
        self.emit(PoolEvent::End);
        let _ = self.done_tx.send(true);
        info!("pool ended");
    }

    /// One pass of the reap / age / timeout / spawn / assign pipeline.
    async fn tick(&mut self) {
        let now = Instant::now();
        self.reap();
        if self.ending {
            self.check_timeouts(now);
            self.progress_end(now).await;
        } else {
            self.age_out(now).await;
            self.check_timeouts(now);
            self.spawn_as_needed(now).await;
            self.assign().await;
        }
        if self.breaker_tripped && !self.ending {
            self.breaker_tripped = false;
            self.begin_end(true).await;
        }
        self.escalate_ending(now);
        self.answer_pid_queries();
        self.update_gauges();
    }

    fn on_enqueue(&mut self, task: QueuedTask) {
        if self.ending {
            let _ = task.settle(TaskOutcome::Error(PoolError::Ended));
            return;
        }
        debug!(command = %task.command, "task enqueued");
        self.queue.push_back(task);
    }

    fn on_worker_msg(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Line {
                pid,
                source: StreamSource::Stdout,
                line,
            } => self.on_stdout_line(pid, line),
            WorkerMsg::Line {
                pid,
                source: StreamSource::Stderr,
                line,
            } => self.on_stderr_line(pid, line),
            WorkerMsg::Exited { pid, code } => self.on_exit(pid, code),
        }
    }

    fn on_stdout_line(&mut self, pid: u32, line: String) {
        let Some(i) = self.worker_index(pid) else {
            trace!(pid, "stdout line from unknown worker");
            return;
        };
        let outcome = self.workers[i]
            .handle
            .on_stdout_line(&line, &self.opts.pass, &self.opts.fail);
        match outcome {
            LineOutcome::Buffered | LineOutcome::Ignored => {}
            LineOutcome::Ready => {
                debug!(pid, "worker passed startup probe");
                self.emit(PoolEvent::ChildStart { pid });
            }
            LineOutcome::Completed(completion) => self.finish_task(i, completion),
            LineOutcome::Unexpected => {
                self.internal_error(format!("worker {pid} produced output while idle: {line:?}"));
            }
        }
    }

    fn on_stderr_line(&mut self, pid: u32, line: String) {
        let Some(i) = self.worker_index(pid) else {
            trace!(pid, "stderr line from unknown worker");
            return;
        };
        trace!(pid, line = %line, "stderr");
        self.workers[i].handle.on_stderr_line(&line);
    }

    fn on_exit(&mut self, pid: u32, code: Option<i32>) {
        let Some(i) = self.worker_index(pid) else {
            trace!(pid, "exit notice for unknown worker");
            return;
        };
        let prior = self.workers[i].handle.note_exit();
        match prior {
            ChildState::Starting => {
                warn!(pid, ?code, "worker exited during start");
                let message = match code {
                    Some(c) => format!("worker {pid} exited during start (exit code {c})"),
                    None => format!("worker {pid} exited during start (killed by signal)"),
                };
                self.workers[i]
                    .end_reason
                    .get_or_insert(EndReason::StartupFailed);
                self.emit(PoolEvent::StartError { message });
                let now = Instant::now();
                self.failures.record(now);
                self.trip_breaker_if_needed(now);
            }
            ChildState::Busy => {
                let had_output = self.workers[i].handle.has_attempt_output();
                let task = self.workers[i].current.take();
                self.workers[i].end_reason.get_or_insert(EndReason::Crashed);
                match task {
                    Some(mut task) => {
                        if !self.ending && !had_output && task.retries == 0 {
                            // Died before producing anything: the command may
                            // never have reached it. One retry at the head.
                            task.retries += 1;
                            debug!(
                                pid,
                                command = %task.command,
                                "worker died before output; retrying task at queue head"
                            );
                            self.queue.push_front(task);
                        } else {
                            warn!(pid, command = %task.command, "worker died mid-task");
                            let error = if self.ending {
                                PoolError::Ended
                            } else {
                                PoolError::ChildDied
                            };
                            if let Some(err) = task.settle(TaskOutcome::Error(error)) {
                                self.emit(PoolEvent::TaskError {
                                    message: err.to_string(),
                                });
                            }
                        }
                    }
                    None => {
                        self.internal_error(format!("busy worker {pid} had no task at exit"));
                    }
                }
            }
            ChildState::Idle => {
                warn!(pid, ?code, "idle worker exited unexpectedly");
                self.workers[i].end_reason.get_or_insert(EndReason::Crashed);
            }
            ChildState::Ending => {
                debug!(pid, ?code, "worker exited after retirement");
            }
            ChildState::Dead => {}
        }
    }

    fn finish_task(&mut self, i: usize, completion: TaskCompletion) {
        let pid = self.workers[i].handle.pid();
        let Some(task) = self.workers[i].current.take() else {
            self.internal_error(format!("worker {pid} completed a task it was never assigned"));
            return;
        };
        let command = task.command.clone();
        let failed = completion.failed;
        let data = completion.stdout.clone();
        self.metrics.inc_completed();
        let err = task.settle(TaskOutcome::Completed {
            stdout: completion.stdout,
            stderr: completion.stderr,
            failed,
        });
        if !failed {
            self.emit(PoolEvent::TaskData {
                pid,
                command: command.clone(),
                data,
            });
        }
        match err {
            Some(e) => {
                debug!(pid, command = %command, error = %e, "task settled with error");
                self.emit(PoolEvent::TaskError {
                    message: e.to_string(),
                });
            }
            None => debug!(pid, command = %command, "task completed"),
        }
    }

    /// Step 1: drop dead handles and announce their exit.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].handle.state() != ChildState::Dead {
                i += 1;
                continue;
            }
            let worker = self.workers.remove(i);
            let pid = worker.handle.pid();
            let reason = worker.end_reason.unwrap_or(EndReason::Crashed);
            self.metrics.record_end_reason(reason);
            debug!(pid, reason = %reason, "reaped worker");
            if let Some(task) = worker.current {
                self.internal_error(format!("worker {pid} was reaped with an unsettled task"));
                let _ = task.settle(TaskOutcome::Error(PoolError::ChildDied));
            }
            self.emit(PoolEvent::ChildExit { pid });
        }
    }

    /// Step 2: retire idle workers that hit the task-count or age policy.
    async fn age_out(&mut self, now: Instant) {
        let exit_cmd = self.opts.exit_command.clone();
        let newline = self.opts.newline;
        let grace = self.opts.end_graceful_wait();
        let max_tasks = self.opts.max_tasks_per_process;
        let max_age = self.opts.max_proc_age();

        for i in 0..self.workers.len() {
            if self.workers[i].handle.state() != ChildState::Idle {
                continue;
            }
            let reason = if self.workers[i].handle.task_count() >= max_tasks {
                EndReason::TaskCount
            } else if self.workers[i].handle.age(now) >= max_age {
                EndReason::Aged
            } else {
                continue;
            };
            let pid = self.workers[i].handle.pid();
            debug!(pid, reason = %reason, "retiring worker");
            self.workers[i].end_reason = Some(reason);
            if self.workers[i]
                .handle
                .send_command(&exit_cmd, newline)
                .await
                .is_err()
            {
                self.workers[i].handle.kill(false);
            }
            self.workers[i].handle.begin_ending(now + grace);
        }
    }

    /// Step 3: enforce task deadlines on busy workers and the probe deadline
    /// on starting ones.
    fn check_timeouts(&mut self, now: Instant) {
        let grace = self.opts.end_graceful_wait();
        let task_timeout_millis = self.opts.task_timeout_millis;
        let spawn_timeout_millis = self.opts.spawn_timeout_millis;

        for i in 0..self.workers.len() {
            if !self.workers[i].handle.deadline_passed(now) {
                continue;
            }
            match self.workers[i].handle.state() {
                ChildState::Busy => {
                    let pid = self.workers[i].handle.pid();
                    warn!(pid, task_timeout_millis, "task timed out; killing worker");
                    let task = self.workers[i].current.take();
                    self.workers[i].end_reason = Some(EndReason::TaskTimeout);
                    self.workers[i].handle.begin_ending(now + grace);
                    self.workers[i].handle.kill(false);
                    match task {
                        Some(task) => {
                            if let Some(err) = task.settle(TaskOutcome::Error(PoolError::Timeout {
                                millis: task_timeout_millis,
                            })) {
                                self.emit(PoolEvent::TaskError {
                                    message: err.to_string(),
                                });
                            }
                        }
                        None => {
                            self.internal_error(format!("busy worker {pid} had no task at timeout"));
                        }
                    }
                }
                ChildState::Starting => {
                    let pid = self.workers[i].handle.pid();
                    warn!(pid, spawn_timeout_millis, "startup probe timed out");
                    self.workers[i].end_reason = Some(EndReason::StartupTimeout);
                    self.workers[i].handle.begin_ending(now + grace);
                    self.workers[i].handle.kill(false);
                    self.emit(PoolEvent::StartError {
                        message: format!(
                            "worker {pid} did not pass the startup probe within {spawn_timeout_millis} ms"
                        ),
                    });
                    self.failures.record(now);
                    self.trip_breaker_if_needed(now);
                }
                _ => {}
            }
        }
    }

    /// Step 4: spawn workers while there is unmet demand and room.
    async fn spawn_as_needed(&mut self, now: Instant) {
        if self.breaker_tripped {
            return;
        }
        loop {
            let assignable = self
                .workers
                .iter()
                .filter(|w| {
                    matches!(
                        w.handle.state(),
                        ChildState::Starting | ChildState::Idle
                    )
                })
                .count();
            if self.queue.len() <= assignable || self.workers.len() >= self.opts.max_procs {
                return;
            }

            let cmd = (self.factory)();
            match spawn_worker(cmd) {
                Ok(spawned) => {
                    self.metrics.inc_spawned();
                    let pid = spawned.pid;
                    let mut handle =
                        ChildHandle::new(pid, spawned.stdin, now + self.opts.spawn_timeout());
                    spawn_output_pump(
                        pid,
                        spawned.child,
                        spawned.stdout,
                        spawned.stderr,
                        self.opts.newline,
                        self.worker_tx.clone(),
                    );
                    if let Err(e) = handle
                        .send_command(&self.opts.version_command, self.opts.newline)
                        .await
                    {
                        // Broken stdin straight out of spawn; the exit notice
                        // will classify it as a startup failure.
                        warn!(pid, error = %e, "failed to write startup probe");
                        handle.kill(true);
                    }
                    self.workers.push(Worker {
                        handle,
                        current: None,
                        end_reason: None,
                        shutdown_deadline: None,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to spawn worker");
                    self.emit(PoolEvent::StartError {
                        message: e.to_string(),
                    });
                    self.failures.record(now);
                    self.trip_breaker_if_needed(now);
                    // Tasks stay queued; try again next tick.
                    return;
                }
            }
        }
    }

    /// Step 5: hand head-of-queue tasks to idle workers in insertion order.
    async fn assign(&mut self) {
        let newline = self.opts.newline;
        let task_timeout = self.opts.task_timeout();

        for i in 0..self.workers.len() {
            if self.queue.is_empty() {
                return;
            }
            if self.workers[i].handle.state() != ChildState::Idle {
                continue;
            }
            let task = self.queue.pop_front().expect("queue checked non-empty");
            let pid = self.workers[i].handle.pid();
            let deadline = Instant::now() + task_timeout;
            if !self.workers[i].handle.begin_task(deadline) {
                self.internal_error(format!("worker {pid} refused a task while idle"));
                self.queue.push_front(task);
                continue;
            }
            let command = task.command.clone();
            match self.workers[i].handle.send_command(&command, newline).await {
                Ok(()) => {
                    debug!(pid, command = %command, "assigned task");
                    self.workers[i].current = Some(task);
                }
                Err(e) => {
                    // The worker's stdin is gone; put the task back and let
                    // the exit notice reap the worker.
                    warn!(pid, error = %e, "failed to write task command; recycling worker");
                    self.queue.push_front(task);
                    self.workers[i].end_reason = Some(EndReason::Crashed);
                    self.workers[i].handle.begin_ending(Instant::now());
                    self.workers[i].handle.kill(true);
                }
            }
        }
    }

    /// Move the whole pool toward shutdown. Idempotent.
    async fn begin_end(&mut self, graceful: bool) {
        if self.ending {
            return;
        }
        info!(graceful, "ending pool");
        self.ending = true;
        self.graceful = graceful;
        self.metrics.set_ended();
        self.emit(PoolEvent::BeforeEnd);

        for task in self.queue.drain(..) {
            let _ = task.settle(TaskOutcome::Error(PoolError::Ended));
        }

        let now = Instant::now();
        let exit_cmd = self.opts.exit_command.clone();
        let newline = self.opts.newline;
        let grace = self.opts.end_graceful_wait();

        for i in 0..self.workers.len() {
            match self.workers[i].handle.state() {
                ChildState::Idle | ChildState::Starting => {
                    self.workers[i].end_reason.get_or_insert(EndReason::PoolEnded);
                    if graceful {
                        let _ = self.workers[i].handle.send_command(&exit_cmd, newline).await;
                        self.workers[i].handle.begin_ending(now + grace);
                    } else {
                        self.workers[i].handle.begin_ending(now);
                        self.workers[i].handle.kill(true);
                    }
                }
                ChildState::Busy => {
                    self.workers[i].end_reason.get_or_insert(EndReason::PoolEnded);
                    if graceful {
                        self.workers[i].shutdown_deadline = Some(now + grace);
                    } else {
                        if let Some(task) = self.workers[i].current.take() {
                            let _ = task.settle(TaskOutcome::Error(PoolError::Ended));
                        }
                        self.workers[i].handle.begin_ending(now);
                        self.workers[i].handle.kill(true);
                    }
                }
                ChildState::Ending | ChildState::Dead => {}
            }
        }
    }

    /// During shutdown: retire workers as they go idle, and give up on busy
    /// ones whose graceful window has expired.
    async fn progress_end(&mut self, now: Instant) {
        let exit_cmd = self.opts.exit_command.clone();
        let newline = self.opts.newline;
        let grace = self.opts.end_graceful_wait();

        for i in 0..self.workers.len() {
            match self.workers[i].handle.state() {
                ChildState::Idle | ChildState::Starting => {
                    self.workers[i].end_reason.get_or_insert(EndReason::PoolEnded);
                    if self.graceful {
                        let _ = self.workers[i].handle.send_command(&exit_cmd, newline).await;
                        self.workers[i].handle.begin_ending(now + grace);
                    } else {
                        self.workers[i].handle.begin_ending(now);
                        self.workers[i].handle.kill(true);
                    }
                }
                ChildState::Busy => {
                    if self.workers[i]
                        .shutdown_deadline
                        .is_some_and(|d| now >= d)
                    {
                        let pid = self.workers[i].handle.pid();
                        warn!(pid, "task still running at shutdown deadline; killing worker");
                        let task = self.workers[i].current.take();
                        self.workers[i].handle.begin_ending(now + grace);
                        self.workers[i].handle.kill(false);
                        if let Some(task) = task {
                            if let Some(err) = task.settle(TaskOutcome::Error(PoolError::Ended)) {
                                self.emit(PoolEvent::TaskError {
                                    message: err.to_string(),
                                });
                            }
                        }
                    }
                }
                ChildState::Ending | ChildState::Dead => {}
            }
        }
    }

    /// SIGTERM ending workers past their deadline; SIGKILL on the next pass.
    fn escalate_ending(&mut self, now: Instant) {
        let grace = self.opts.end_graceful_wait();
        for worker in &mut self.workers {
            if worker.handle.state() == ChildState::Ending && worker.handle.deadline_passed(now) {
                worker.handle.escalate(now, grace);
            }
        }
    }

    fn trip_breaker_if_needed(&mut self, now: Instant) {
        if self.ending || self.breaker_tripped {
            return;
        }
        let count = self.failures.count(now);
        let max = self.opts.max_process_failures_per_minute as usize;
        if count > max {
            error!(count, max, "worker failure rate exceeded; ending pool");
            self.emit(PoolEvent::EndError {
                message: format!(
                    "{count} worker failures in the last minute exceeds the limit of {max}"
                ),
            });
            self.breaker_tripped = true;
        }
    }

    fn answer_pid_queries(&mut self) {
        if self.pid_queries.is_empty() {
            return;
        }
        let pids: Vec<u32> = self
            .workers
            .iter()
            .filter(|w| w.handle.state() != ChildState::Dead)
            .map(|w| w.handle.pid())
            .collect();
        for query in self.pid_queries.drain(..) {
            let _ = query.send(pids.clone());
        }
    }

    fn update_gauges(&self) {
        self.metrics.set_pending(self.queue.len() as u64);
        let busy = self
            .workers
            .iter()
            .filter(|w| w.handle.state() == ChildState::Busy)
            .count();
        self.metrics.set_busy(busy as u64);
    }

    fn worker_index(&self, pid: u32) -> Option<usize> {
        self.workers.iter().position(|w| w.handle.pid() == pid)
    }

    fn internal_error(&self, message: String) {
        warn!(message = %message, "internal error");
        self.metrics.inc_internal_errors();
        self.emit(PoolEvent::InternalError { message });
    }

    fn emit(&self, event: PoolEvent) {
        // No receivers is fine; events are best-effort observability.
        let _ = self.events.send(event);
    }
}
