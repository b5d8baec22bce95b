use crate::error::ConfigError;
use crate::gate::MAX_CAPACITY;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;

pub(crate) const DEFAULT_CONCURRENCY: usize = 10;
pub(crate) const DEFAULT_POOL_NAME: &str = "batch";

/// What happens to a processor invocation that loses the race against its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutBehavior {
  /// Drop the processor's future. Nothing keeps running after the timeout fires.
  #[default]
  Cancel,
  /// Stop waiting but let the invocation run to completion in the background.
  /// Its result is discarded and it no longer counts against the concurrency limit.
  Detach,
}

/// Validated settings shared by every batch created from one `BatchPool`.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
  pub(crate) name: Arc<String>,
  pub(crate) concurrency: usize,
  pub(crate) policy: TaskPolicy,
  pub(crate) stop_on_failure: bool,
  pub(crate) runtime: Option<TokioHandle>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: Arc::new(DEFAULT_POOL_NAME.to_string()),
      concurrency: DEFAULT_CONCURRENCY,
      policy: TaskPolicy::default(),
      stop_on_failure: false,
      runtime: None,
    }
  }
}

/// The per-task part of the configuration, consumed by the task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskPolicy {
  pub(crate) timeout: Option<Duration>,
  pub(crate) timeout_behavior: TimeoutBehavior,
  pub(crate) retry_limit: u32,
  pub(crate) retry_on_timeout: bool,
  pub(crate) retry_delay: Duration,
}

impl Default for TaskPolicy {
  fn default() -> Self {
    Self {
      timeout: None,
      timeout_behavior: TimeoutBehavior::Cancel,
      retry_limit: 0,
      retry_on_timeout: false,
      retry_delay: Duration::ZERO,
    }
  }
}

/// Chained configuration for a [`BatchPool`](crate::BatchPool).
///
/// Setters never fail. Out-of-range values are reported by [`PoolBuilder::build`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
  name: String,
  concurrency: usize,
  timeout_limit_ms: i64,
  timeout_behavior: TimeoutBehavior,
  retry_limit: u32,
  retry_on_timeout: bool,
  retry_delay: Duration,
  stop_on_failure: bool,
  runtime: Option<TokioHandle>,
}

impl Default for PoolBuilder {
  fn default() -> Self {
    Self {
      name: DEFAULT_POOL_NAME.to_string(),
      concurrency: DEFAULT_CONCURRENCY,
      timeout_limit_ms: 0,
      timeout_behavior: TimeoutBehavior::default(),
      retry_limit: 0,
      retry_on_timeout: false,
      retry_delay: Duration::ZERO,
      stop_on_failure: false,
      runtime: None,
    }
  }
}

impl PoolBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in log fields.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Maximum number of tasks in flight at once. Must be at least 1.
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency;
    self
  }

  /// Per-attempt timeout in milliseconds. `0` disables it; negative values are rejected.
  pub fn timeout_limit(mut self, millis: i64) -> Self {
    self.timeout_limit_ms = millis;
    self
  }

  pub fn timeout_behavior(mut self, behavior: TimeoutBehavior) -> Self {
    self.timeout_behavior = behavior;
    self
  }

  /// Number of additional attempts after a processor error.
  pub fn retry_limit(mut self, retries: u32) -> Self {
    self.retry_limit = retries;
    self
  }

  /// Whether a timed-out attempt consumes the retry budget instead of failing the task.
  pub fn retry_on_timeout(mut self, enabled: bool) -> Self {
    self.retry_on_timeout = enabled;
    self
  }

  /// Fixed pause before each retry.
  pub fn retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn stop_on_failure(mut self, enabled: bool) -> Self {
    self.stop_on_failure = enabled;
    self
  }

  /// Runtime that drives batches. Defaults to the runtime `run` is called from.
  pub fn runtime(mut self, handle: TokioHandle) -> Self {
    self.runtime = Some(handle);
    self
  }

  pub fn build(self) -> Result<crate::BatchPool, ConfigError> {
    if self.concurrency == 0 {
      return Err(ConfigError::ZeroConcurrency);
    }
    if self.concurrency > MAX_CAPACITY {
      return Err(ConfigError::ConcurrencyTooLarge(self.concurrency));
    }
    if self.timeout_limit_ms < 0 {
      return Err(ConfigError::NegativeTimeout(self.timeout_limit_ms));
    }

    let timeout = match self.timeout_limit_ms {
      0 => None,
      ms => Some(Duration::from_millis(ms as u64)),
    };

    let config = PoolConfig {
      name: Arc::new(self.name),
      concurrency: self.concurrency,
      policy: TaskPolicy {
        timeout,
        timeout_behavior: self.timeout_behavior,
        retry_limit: self.retry_limit,
        retry_on_timeout: self.retry_on_timeout,
        retry_delay: self.retry_delay,
      },
      stop_on_failure: self.stop_on_failure,
      runtime: self.runtime,
    };
    Ok(crate::BatchPool::from_config(config))
  }
}
