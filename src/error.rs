use std::time::Duration;

use thiserror::Error;

/// Configuration rejected before any run starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("concurrency must be at least 1")]
  ZeroConcurrency,

  #[error("concurrency {0} exceeds the largest supported limit ({max})", max = crate::gate::MAX_CAPACITY)]
  ConcurrencyTooLarge(usize),

  #[error("timeout limit must not be negative (got {0} ms)")]
  NegativeTimeout(i64),

  #[error("no processor was bound to the batch before run")]
  MissingProcessor,

  #[error("no Tokio runtime available to drive the batch")]
  NoRuntime,
}

/// Errors that settle a batch run.
///
/// `E` is the processor's own error type. The enum is `Clone` because the outcome of a
/// single run is handed to every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError<E> {
  #[error("invalid argument: {0}")]
  InvalidArgument(#[from] ConfigError),

  #[error("processor failed on input #{index} after {attempts} attempt(s): {error}")]
  Processor { index: usize, attempts: u32, error: E },

  #[error("input #{index} timed out after {limit:?} (attempt {attempts})")]
  Timeout { index: usize, attempts: u32, limit: Duration },

  #[error("processor panicked on input #{index}")]
  TaskPanicked { index: usize },

  #[error("batch was cancelled")]
  Cancelled,

  #[error("batch driver stopped unexpectedly: {0}")]
  DriverFailed(String),
}

impl<E> BatchError<E> {
  /// Index of the input whose task produced this error, if any.
  pub fn input_index(&self) -> Option<usize> {
    match self {
      BatchError::Processor { index, .. } | BatchError::Timeout { index, .. } | BatchError::TaskPanicked { index } => {
        Some(*index)
      }
      _ => None,
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, BatchError::Timeout { .. })
  }
}
