//! Worker spawning, the pipe reader pump, and process-group signalling.

use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use procmux_core::{Newline, PoolError};

use crate::framing::LineBuffer;

const READ_BUF_SIZE: usize = 4096;

/// Which pipe a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// Messages the reader pump forwards to the scheduler. For one worker the
/// channel is FIFO, and `Exited` is always last: both pipes are drained to
/// EOF before the exit status is reported.
#[derive(Debug)]
pub enum WorkerMsg {
    Line {
        pid: u32,
        source: StreamSource,
        line: String,
    },
    Exited {
        pid: u32,
        code: Option<i32>,
    },
}

/// A freshly spawned worker, pipes taken and ready to be pumped.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: u32,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub child: Child,
}

/// Spawn a worker with piped stdio.
///
/// The child is made its own process-group leader so signals reach
/// grandchildren, and `kill_on_drop` is set as a safety net.
pub fn spawn_worker(mut cmd: Command) -> Result<SpawnedWorker, PoolError> {
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| PoolError::SpawnFailed("spawned worker has no pid".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PoolError::SpawnFailed("worker stdin was not piped".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PoolError::SpawnFailed("worker stdout was not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PoolError::SpawnFailed("worker stderr was not piped".into()))?;

    debug!(pid, "spawned worker");
    Ok(SpawnedWorker {
        pid,
        stdin,
        stdout,
        stderr,
        child,
    })
}

/// Pump stdout and stderr concurrently, forwarding complete lines to the
/// scheduler, then wait for the process and report its exit.
///
/// Byte-level reads keep partial lines buffered until the newline arrives;
/// a remainder left at EOF is flushed as a final line so a crashed child's
/// last words are not lost.
pub fn spawn_output_pump(
    pid: u32,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    newline: Newline,
    tx: UnboundedSender<WorkerMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut out_reader = BufReader::new(stdout);
        let mut err_reader = BufReader::new(stderr);
        let mut out_lines = LineBuffer::new(newline);
        let mut err_lines = LineBuffer::new(newline);
        let mut out_buf = [0u8; READ_BUF_SIZE];
        let mut err_buf = [0u8; READ_BUF_SIZE];
        let mut out_done = false;
        let mut err_done = false;

        while !out_done || !err_done {
            tokio::select! {
                result = out_reader.read(&mut out_buf), if !out_done => {
                    match result {
                        Ok(0) | Err(_) => {
                            if let Some(rest) = out_lines.take_remainder() {
                                forward(&tx, pid, StreamSource::Stdout, rest);
                            }
                            out_done = true;
                        }
                        Ok(n) => {
                            out_lines.extend(&String::from_utf8_lossy(&out_buf[..n]));
                            while let Some(line) = out_lines.next_line() {
                                forward(&tx, pid, StreamSource::Stdout, line);
                            }
                        }
                    }
                }
                result = err_reader.read(&mut err_buf), if !err_done => {
                    match result {
                        Ok(0) | Err(_) => {
                            if let Some(rest) = err_lines.take_remainder() {
                                forward(&tx, pid, StreamSource::Stderr, rest);
                            }
                            err_done = true;
                        }
                        Ok(n) => {
                            err_lines.extend(&String::from_utf8_lossy(&err_buf[..n]));
                            while let Some(line) = err_lines.next_line() {
                                forward(&tx, pid, StreamSource::Stderr, line);
                            }
                        }
                    }
                }
            }
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid, error = %e, "failed to wait for worker");
                None
            }
        };
        debug!(pid, ?code, "worker exited");
        let _ = tx.send(WorkerMsg::Exited { pid, code });
    })
}

fn forward(tx: &UnboundedSender<WorkerMsg>, pid: u32, source: StreamSource, line: String) {
    // A closed channel means the scheduler is gone; the pump still drains
    // the pipes and reaps the child before returning.
    let _ = tx.send(WorkerMsg::Line { pid, source, line });
}

/// Signal the worker's whole process group. `force` sends SIGKILL,
/// otherwise SIGTERM. The caller treats the worker as dead only once the
/// pump reports the actual exit.
pub fn kill_process_group(pid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // SAFETY: kill() is async-signal-safe; negative PID targets the group.
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
        warn!(pid, "process-group signalling is unsupported on this platform");
    }
}
