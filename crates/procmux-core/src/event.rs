//! Pool lifecycle events, delivered over a broadcast channel.

use serde::Serialize;

/// Observable pool lifecycle events.
///
/// For a single worker the ordering is strict:
/// `ChildStart` < any `TaskData` < `ChildExit`. Across workers no ordering
/// is guaranteed.
#[derive(Debug, Clone, Serialize)]
pub enum PoolEvent {
    /// A worker passed its startup probe and is ready for tasks.
    ChildStart { pid: u32 },
    /// A worker was removed from the pool after its process exited.
    ChildExit { pid: u32 },
    /// A worker could not be spawned or failed during startup.
    StartError { message: String },
    /// The pool is ending itself because of repeated spawn failures.
    EndError { message: String },
    /// The scheduler caught a condition it could not attribute to a task.
    InternalError { message: String },
    /// A task completed with the pass marker; `data` is the accumulated
    /// stdout handed to the parser.
    TaskData {
        pid: u32,
        command: String,
        data: String,
    },
    /// A task settled with an error.
    TaskError { message: String },
    /// Shutdown has begun; workers are being drained.
    BeforeEnd,
    /// Shutdown is complete; the pool is empty.
    End,
}

/// Why a worker left the pool. Tallied per reason for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EndReason {
    /// Spawn succeeded but the process exited before passing the probe.
    StartupFailed,
    /// The startup probe did not pass within `spawn_timeout_millis`.
    StartupTimeout,
    /// Retired after `max_tasks_per_process` completed tasks.
    TaskCount,
    /// Retired after `max_proc_age_millis` of wall-clock age.
    Aged,
    /// Killed because a task passed its deadline.
    TaskTimeout,
    /// Exited on its own while idle or mid-task.
    Crashed,
    /// Shut down because the pool ended.
    PoolEnded,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartupFailed => "startup-failed",
            Self::StartupTimeout => "startup-timeout",
            Self::TaskCount => "task-count",
            Self::Aged => "aged",
            Self::TaskTimeout => "task-timeout",
            Self::Crashed => "crashed",
            Self::PoolEnded => "pool-ended",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_payload() {
        let event = PoolEvent::TaskData {
            pid: 42,
            command: "upcase abc".into(),
            data: "ABC".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"pid\":42"));
        assert!(json.contains("\"upcase abc\""));
    }

    #[test]
    fn test_end_reason_display() {
        assert_eq!(EndReason::TaskCount.to_string(), "task-count");
        assert_eq!(EndReason::StartupTimeout.to_string(), "startup-timeout");
    }
}
