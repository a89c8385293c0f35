//! Shared types for the process pool: error taxonomy, events, and options.

pub mod error;
pub mod event;
pub mod options;

pub use error::PoolError;
pub use event::{EndReason, PoolEvent};
pub use options::{Newline, PoolOptions};
