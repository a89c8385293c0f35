//! Pool configuration and cross-field validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Wire framing for the child protocol. Must match what the child emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Newline {
    #[default]
    Lf,
    CrLf,
}

impl Newline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

/// Configuration for a [`ProcessPool`](https://docs.rs/procmux).
///
/// Validated once at pool construction; every broken rule accumulates into a
/// single [`PoolError::InvalidOptions`] listing each violation on its own
/// line, in field declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Upper bound on live workers.
    pub max_procs: usize,
    /// Retire a worker after this many completed tasks.
    pub max_tasks_per_process: u32,
    /// Retire a worker on next idle once it reaches this wall-clock age.
    /// Must cover at least one spawn and one task timeout.
    pub max_proc_age_millis: u64,
    /// Maximum time for a fresh worker to answer the startup probe.
    pub spawn_timeout_millis: u64,
    /// Maximum time per task, from assignment to terminal marker.
    pub task_timeout_millis: u64,
    /// Scheduler tick cadence.
    pub on_idle_interval_millis: u64,
    /// How long to wait after `exit_command` before escalating to signals.
    pub end_graceful_wait_millis: u64,
    /// Sliding-window cap on spawn failures; exceeding it ends the pool.
    pub max_process_failures_per_minute: u32,
    /// Post-exit grace period to drain stdout/stderr.
    pub stream_flush_millis: u64,
    /// Command sent to confirm a worker is ready.
    pub version_command: String,
    /// Command asking a worker to exit on its own.
    pub exit_command: String,
    /// Terminal line marking task success.
    pub pass: String,
    /// Terminal line marking task failure.
    pub fail: String,
    /// Newline flavour for both directions of the protocol.
    pub newline: Newline,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_procs: 1,
            max_tasks_per_process: 500,
            max_proc_age_millis: 5 * 60 * 1000,
            spawn_timeout_millis: 15_000,
            task_timeout_millis: 10_000,
            on_idle_interval_millis: 2_000,
            end_graceful_wait_millis: 500,
            max_process_failures_per_minute: 10,
            stream_flush_millis: 10,
            version_command: "version".into(),
            exit_command: "exit".into(),
            pass: "PASS".into(),
            fail: "FAIL".into(),
            newline: Newline::Lf,
        }
    }
}

const MIN_SPAWN_TIMEOUT_MILLIS: u64 = 100;
const MIN_TASK_TIMEOUT_MILLIS: u64 = 10;

impl PoolOptions {
    /// Check every rule, accumulating violations in declaration order.
    pub fn validate(&self) -> Result<(), PoolError> {
        let mut violations = Vec::new();

        if self.max_procs < 1 {
            violations.push("max_procs must be greater than or equal to 1".into());
        }
        if self.max_tasks_per_process < 1 {
            violations.push("max_tasks_per_process must be greater than or equal to 1".into());
        }
        let min_age = self.spawn_timeout_millis.max(self.task_timeout_millis);
        if self.max_proc_age_millis < min_age {
            violations.push(format!(
                "max_proc_age_millis must be greater than or equal to {min_age}"
            ));
        }
        if self.spawn_timeout_millis < MIN_SPAWN_TIMEOUT_MILLIS {
            violations.push(format!(
                "spawn_timeout_millis must be greater than or equal to {MIN_SPAWN_TIMEOUT_MILLIS}"
            ));
        }
        if self.task_timeout_millis < MIN_TASK_TIMEOUT_MILLIS {
            violations.push(format!(
                "task_timeout_millis must be greater than or equal to {MIN_TASK_TIMEOUT_MILLIS}"
            ));
        }
        for (name, value) in [
            ("version_command", &self.version_command),
            ("exit_command", &self.exit_command),
            ("pass", &self.pass),
            ("fail", &self.fail),
        ] {
            if value.trim().is_empty() {
                violations.push(format!("{name} must not be blank"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(PoolError::InvalidOptions { violations })
        }
    }

    /// Validate and return the options by value, for builder-style call sites.
    pub fn validated(self) -> Result<Self, PoolError> {
        self.validate()?;
        Ok(self)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_millis)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_millis)
    }

    pub fn max_proc_age(&self) -> Duration {
        Duration::from_millis(self.max_proc_age_millis)
    }

    pub fn end_graceful_wait(&self) -> Duration {
        Duration::from_millis(self.end_graceful_wait_millis)
    }

    pub fn stream_flush(&self) -> Duration {
        Duration::from_millis(self.stream_flush_millis)
    }
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
