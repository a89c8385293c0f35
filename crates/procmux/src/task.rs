//! Tasks: a command string plus a parser, erased for queue storage.

use tokio::sync::oneshot;

use procmux_core::PoolError;

/// One request/response unit: the command written to a worker's stdin and
/// the parser applied to the accumulated response.
///
/// The parser receives the content lines from stdout and stderr (markers
/// excluded, newline-joined) and returns the task's typed value or a
/// rejection message.
pub struct Task<T> {
    command: String,
    parser: Box<dyn FnMut(&str, &str) -> Result<T, String> + Send>,
}

impl<T> Task<T> {
    pub fn new(
        command: impl Into<String>,
        parser: impl FnMut(&str, &str) -> Result<T, String> + Send + 'static,
    ) -> Self {
        Self {
            command: command.into(),
            parser: Box::new(parser),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Task<String> {
    /// A task that resolves to the raw accumulated stdout.
    pub fn passthrough(command: impl Into<String>) -> Self {
        Self::new(command, |stdout, _stderr| Ok(stdout.to_string()))
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("command", &self.command).finish()
    }
}

/// How one task attempt ended, before parsing.
pub(crate) enum TaskOutcome {
    /// A terminal marker arrived; the attempt's accumulated output.
    Completed {
        stdout: String,
        stderr: String,
        failed: bool,
    },
    /// The attempt failed outside the protocol (timeout, death, shutdown).
    Error(PoolError),
}

/// A type-erased task as the scheduler stores it. Settling runs the parser
/// and resolves the caller's future exactly once; an unsettled task can be
/// re-queued for retry without losing either.
pub(crate) struct QueuedTask {
    pub(crate) command: String,
    pub(crate) retries: u32,
    settle: Box<dyn FnOnce(TaskOutcome) -> Option<PoolError> + Send>,
}

impl QueuedTask {
    pub(crate) fn new<T: Send + 'static>(
        task: Task<T>,
        reply: oneshot::Sender<Result<T, PoolError>>,
    ) -> Self {
        let command = task.command;
        let mut parser = task.parser;
        let settle = Box::new(move |outcome: TaskOutcome| -> Option<PoolError> {
            let result = match outcome {
                TaskOutcome::Completed {
                    stdout,
                    stderr,
                    failed,
                } => {
                    if !stderr.trim().is_empty() {
                        // stderr poisons the task regardless of the marker.
                        Err(PoolError::StderrOutput { output: stderr })
                    } else if failed {
                        Err(PoolError::FailMarker {
                            output: last_non_empty_line(&stdout).to_string(),
                        })
                    } else {
                        parser(&stdout, &stderr).map_err(PoolError::ParserReject)
                    }
                }
                TaskOutcome::Error(e) => Err(e),
            };
            let err = result.as_ref().err().cloned();
            let _ = reply.send(result);
            err
        });
        Self {
            command,
            retries: 0,
            settle,
        }
    }

    /// Resolve the caller's future. Returns the error the task settled with,
    /// if any, so the scheduler can report it.
    pub(crate) fn settle(self, outcome: TaskOutcome) -> Option<PoolError> {
        (self.settle)(outcome)
    }
}

impl std::fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("command", &self.command)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// Last non-empty line of the given text, or `""`.
fn last_non_empty_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
}
