//! Per-worker protocol state machine.
//!
//! A [`ChildHandle`] owns one worker's stdin and the bookkeeping for the
//! request/response line protocol: which lines are content, which are
//! terminal markers, and which lifecycle state the worker is in. All
//! transitions happen on the scheduler task; reader pumps only feed lines in
//! through [`crate::WorkerMsg`].

use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tracing::{debug, trace};

use procmux_core::{Newline, PoolError};

use crate::spawn::kill_process_group;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Spawned, startup probe written, waiting for the pass marker.
    Starting,
    /// Ready for a task.
    Idle,
    /// A task is in flight.
    Busy,
    /// Asked (or forced) to exit; waiting for the actual process exit.
    Ending,
    /// Process exit observed. Terminal.
    Dead,
}

impl ChildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Ending => "ending",
            Self::Dead => "dead",
        }
    }
}

/// Accumulated output of one finished task attempt.
#[derive(Debug)]
pub struct TaskCompletion {
    /// True when the terminal line was the fail marker.
    pub failed: bool,
    /// Content lines from stdout, newline-joined, markers excluded.
    pub stdout: String,
    /// Content lines from stderr, newline-joined.
    pub stderr: String,
}

/// What a stdout line meant to the protocol.
#[derive(Debug)]
pub enum LineOutcome {
    /// Content line, accumulated for the current attempt.
    Buffered,
    /// Startup probe passed; the worker is now idle.
    Ready,
    /// Terminal marker arrived; the attempt's output is handed back.
    Completed(TaskCompletion),
    /// Chatter from a worker that is ending or dead; dropped.
    Ignored,
    /// Output while idle: protocol violation worth an internal-error count.
    Unexpected,
}

pub struct ChildHandle {
    pid: u32,
    state: ChildState,
    started_at: Instant,
    task_count: u32,
    stdin: ChildStdin,
    stdout_lines: Vec<String>,
    stderr_lines: Vec<String>,
    deadline: Option<Instant>,
    term_sent: bool,
}

impl ChildHandle {
    /// A new handle starts in `Starting` with the spawn deadline armed.
    /// The caller writes the startup probe via [`Self::send_command`].
    pub fn new(pid: u32, stdin: ChildStdin, spawn_deadline: Instant) -> Self {
        Self {
            pid,
            state: ChildState::Starting,
            started_at: Instant::now(),
            task_count: 0,
            stdin,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            deadline: Some(spawn_deadline),
            term_sent: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Whether the current attempt has produced any output on either stream.
    /// Drives the retry rule for workers that die mid-task.
    pub fn has_attempt_output(&self) -> bool {
        !self.stdout_lines.is_empty() || !self.stderr_lines.is_empty()
    }

    /// Write one protocol command plus the configured newline.
    pub async fn send_command(&mut self, command: &str, newline: Newline) -> Result<(), PoolError> {
        trace!(pid = self.pid, command, "writing command");
        let write = async {
            self.stdin.write_all(command.as_bytes()).await?;
            self.stdin.write_all(newline.as_str().as_bytes()).await?;
            self.stdin.flush().await
        };
        write.await.map_err(|e| {
            PoolError::Internal(format!("stdin write to worker {} failed: {e}", self.pid))
        })
    }

    /// Feed one framed stdout line through the state machine.
    pub fn on_stdout_line(&mut self, line: &str, pass: &str, fail: &str) -> LineOutcome {
        match self.state {
            ChildState::Starting => {
                if line.trim() == pass {
                    debug!(pid = self.pid, "worker ready");
                    self.state = ChildState::Idle;
                    self.deadline = None;
                    self.stdout_lines.clear();
                    self.stderr_lines.clear();
                    LineOutcome::Ready
                } else {
                    self.stdout_lines.push(line.to_string());
                    LineOutcome::Buffered
                }
            }
            ChildState::Busy => {
                let trimmed = line.trim();
                if trimmed == pass || trimmed == fail {
                    let completion = TaskCompletion {
                        failed: trimmed == fail,
                        stdout: self.stdout_lines.join("\n"),
                        stderr: self.stderr_lines.join("\n"),
                    };
                    self.state = ChildState::Idle;
                    self.task_count += 1;
                    self.deadline = None;
                    self.stdout_lines.clear();
                    self.stderr_lines.clear();
                    LineOutcome::Completed(completion)
                } else {
                    self.stdout_lines.push(line.to_string());
                    LineOutcome::Buffered
                }
            }
            ChildState::Idle => LineOutcome::Unexpected,
            ChildState::Ending | ChildState::Dead => LineOutcome::Ignored,
        }
    }

    /// Accumulate a stderr line for the current attempt.
    pub fn on_stderr_line(&mut self, line: &str) {
        if self.state != ChildState::Dead {
            self.stderr_lines.push(line.to_string());
        }
    }

    /// Idle → Busy. Returns false (and changes nothing) from any other state.
    pub fn begin_task(&mut self, deadline: Instant) -> bool {
        if self.state != ChildState::Idle {
            return false;
        }
        self.state = ChildState::Busy;
        self.deadline = Some(deadline);
        self.stdout_lines.clear();
        self.stderr_lines.clear();
        true
    }

    /// Move to `Ending` with a deadline for escalation. The worker is no
    /// longer assignable; it stays in the pool until its exit is observed.
    pub fn begin_ending(&mut self, deadline: Instant) {
        if self.state != ChildState::Dead {
            self.state = ChildState::Ending;
            self.deadline = Some(deadline);
        }
    }

    /// Escalate an `Ending` worker that blew its deadline: SIGTERM first,
    /// SIGKILL on the next expiry.
    pub fn escalate(&mut self, now: Instant, grace: Duration) {
        if self.term_sent {
            debug!(pid = self.pid, "graceful window expired twice, SIGKILL");
            kill_process_group(self.pid, true);
            self.deadline = None;
        } else {
            debug!(pid = self.pid, "graceful window expired, SIGTERM");
            kill_process_group(self.pid, false);
            self.term_sent = true;
            self.deadline = Some(now + grace);
        }
    }

    /// Signal the worker directly without waiting for a deadline.
    pub fn kill(&mut self, force: bool) {
        if !force {
            self.term_sent = true;
        }
        kill_process_group(self.pid, force);
    }

    /// Record the observed process exit. Returns the state the worker was
    /// in when it died; the handle is `Dead` afterwards.
    pub fn note_exit(&mut self) -> ChildState {
        let prior = self.state;
        self.state = ChildState::Dead;
        self.deadline = None;
        prior
    }
}

impl std::fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildHandle")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("task_count", &self.task_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "handle_tests.rs"]
mod tests;
