//! A Tokio-based batch runner that drives an async processor over a sequence of
//! inputs with bounded concurrency, per-task timeouts, retries and stop-on-failure.

mod config;
mod error;
mod gate;
mod handle;
mod manager;
mod notifier;
mod runner;
mod task;
mod tracker;

pub use config::{PoolBuilder, TimeoutBehavior};
pub use error::{BatchError, ConfigError};
pub use handle::{BatchOutcome, BatchRun};
pub use manager::{Batch, BatchPool};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use task::{processor_fn, Processor, ProcessorFuture};
