//! Multiplex text tasks onto a pool of long-lived child processes speaking a
//! request/response line protocol over stdin/stdout.
//!
//! Built for external CLI tools whose per-invocation startup cost is too
//! high to pay per call but which have no daemon mode: the pool keeps
//! workers alive across many tasks, bounds how many run and for how long,
//! and reports per-task failures without tearing anything else down.
//!
//! ```no_run
//! use procmux::{PoolOptions, ProcessPool, Task};
//! use tokio::process::Command;
//!
//! # async fn demo() -> Result<(), procmux::PoolError> {
//! let pool = ProcessPool::new(PoolOptions::default(), || Command::new("my-tool"))?;
//! let greeting = pool.enqueue(Task::passthrough("upcase hello")).await?;
//! assert_eq!(greeting, "HELLO");
//! pool.end(true).await;
//! # Ok(())
//! # }
//! ```

mod failure_window;
mod metrics;
mod pool;
mod scheduler;
mod task;

pub use pool::{ProcessPool, TaskHandle};
pub use procmux_core::{EndReason, Newline, PoolError, PoolEvent, PoolOptions};
pub use task::Task;
