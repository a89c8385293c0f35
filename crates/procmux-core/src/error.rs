/// Everything that can go wrong between `enqueue` and a settled task.
///
/// Task futures resolve with exactly one of these; the display strings are
/// part of the public contract and asserted by tests.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Construction-time validation failure. One line per broken rule,
    /// in option declaration order, under a fixed header line.
    #[error("ProcessPool was given invalid options\n{}", violations.join("\n"))]
    InvalidOptions { violations: Vec<String> },

    /// The pool is ending or has ended; no further tasks are accepted.
    #[error("process pool has ended")]
    Ended,

    /// The factory command could not be spawned, or a worker failed its
    /// startup probe. Counted against the failure-rate window.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The task did not reach a terminal marker within its deadline.
    /// The worker is killed and never reused.
    #[error("task did not complete within {millis} ms")]
    Timeout { millis: u64 },

    /// The worker answered with the configured fail marker.
    #[error("worker reported failure: {output}")]
    FailMarker { output: String },

    /// The caller-supplied parser rejected the accumulated output.
    #[error("parser rejected worker output: {0}")]
    ParserReject(String),

    /// The worker wrote to stderr before the terminal marker. The task is
    /// rejected; the worker stays in the pool.
    #[error("worker wrote to stderr: {output}")]
    StderrOutput { output: String },

    /// The worker exited while a task was in flight.
    #[error("worker exited mid-task")]
    ChildDied,

    /// The scheduler hit a condition it could not attribute to any task.
    /// Emitted as an event and counted, never delivered to task futures.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_options() {
        let err = PoolError::InvalidOptions {
            violations: vec![
                "max_procs must be greater than or equal to 1".into(),
                "pass must not be blank".into(),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("ProcessPool was given invalid options\n"));
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("max_procs must be greater than or equal to 1"));
        assert!(text.contains("pass must not be blank"));
    }

    #[test]
    fn test_display_ended() {
        assert_eq!(PoolError::Ended.to_string(), "process pool has ended");
    }

    #[test]
    fn test_display_spawn_failed() {
        let err = PoolError::SpawnFailed("No such file or directory".into());
        assert_eq!(
            err.to_string(),
            "failed to spawn worker: No such file or directory"
        );
    }

    #[test]
    fn test_display_timeout() {
        let err = PoolError::Timeout { millis: 250 };
        assert_eq!(err.to_string(), "task did not complete within 250 ms");
    }

    #[test]
    fn test_display_fail_marker() {
        let err = PoolError::FailMarker {
            output: "unknown command".into(),
        };
        assert_eq!(err.to_string(), "worker reported failure: unknown command");
    }

    #[test]
    fn test_display_stderr_output() {
        let err = PoolError::StderrOutput {
            output: "warning: deprecated flag".into(),
        };
        assert_eq!(
            err.to_string(),
            "worker wrote to stderr: warning: deprecated flag"
        );
    }

    #[test]
    fn test_display_child_died() {
        assert_eq!(PoolError::ChildDied.to_string(), "worker exited mid-task");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PoolError>();
    }
}
