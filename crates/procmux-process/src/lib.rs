//! Child-process plumbing: spawning with piped stdio, line framing, the
//! per-worker protocol state machine, and signal helpers.

pub mod framing;
pub mod handle;
pub mod spawn;

pub use framing::LineBuffer;
pub use handle::{ChildHandle, ChildState, LineOutcome, TaskCompletion};
pub use spawn::{
    SpawnedWorker, StreamSource, WorkerMsg, kill_process_group, spawn_output_pump, spawn_worker,
};
