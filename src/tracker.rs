use crate::error::BatchError;

/// Lifecycle of one batch as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
  Running,
  /// A terminal failure (with stop-on-failure) or a cancellation ended the run.
  /// Later completions are discarded.
  Aborted,
  Settled,
}

/// Bookkeeping for one batch run.
///
/// Counters, results and the error slot live together so that every task completion is
/// recorded as one transaction under the batch's mutex.
#[derive(Debug)]
pub(crate) struct CompletionTracker<R, E> {
  total: usize,
  stop_on_failure: bool,
  admitted: usize,
  in_flight: usize,
  peak_in_flight: usize,
  finished: usize,
  results: Vec<R>,
  error: Option<BatchError<E>>,
  phase: Phase,
}

impl<R, E> CompletionTracker<R, E> {
  pub(crate) fn new(total: usize, stop_on_failure: bool) -> Self {
    Self {
      total,
      stop_on_failure,
      admitted: 0,
      in_flight: 0,
      peak_in_flight: 0,
      finished: 0,
      results: Vec::with_capacity(total),
      error: None,
      phase: Phase::Running,
    }
  }

  #[cfg(test)]
  pub(crate) fn phase(&self) -> Phase {
    self.phase
  }

  pub(crate) fn is_running(&self) -> bool {
    self.phase == Phase::Running
  }

  pub(crate) fn in_flight(&self) -> usize {
    self.in_flight
  }

  pub(crate) fn peak_in_flight(&self) -> usize {
    self.peak_in_flight
  }

  pub(crate) fn finished(&self) -> usize {
    self.finished
  }

  pub(crate) fn admitted(&self) -> usize {
    self.admitted
  }

  /// Counts one more task as in flight. Returns `false` once the run is no longer
  /// accepting work.
  pub(crate) fn admit(&mut self) -> bool {
    if !self.is_running() || self.admitted >= self.total {
      return false;
    }
    self.admitted += 1;
    self.in_flight += 1;
    self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
    true
  }

  /// Records the terminal outcome of one admitted task.
  ///
  /// Returns `false` if the outcome was discarded because the run had already been
  /// aborted or settled.
  pub(crate) fn record(&mut self, outcome: Result<R, BatchError<E>>) -> bool {
    if !self.is_running() {
      return false;
    }

    self.in_flight = self.in_flight.saturating_sub(1);
    self.finished += 1;

    match outcome {
      Ok(value) => self.results.push(value),
      Err(error) => {
        self.error = Some(error);
        if self.stop_on_failure {
          self.abort();
        }
      }
    }
    true
  }

  /// Aborts a running batch from outside.
  pub(crate) fn cancel(&mut self) {
    if self.is_running() {
      self.error = Some(BatchError::Cancelled);
      self.abort();
    }
  }

  fn abort(&mut self) {
    self.phase = Phase::Aborted;
    self.in_flight = 0;
    self.results.clear();
  }

  /// Takes the batch outcome once the run is decided. Yields `Some` exactly once.
  pub(crate) fn settlement(&mut self) -> Option<Result<Vec<R>, BatchError<E>>> {
    match self.phase {
      Phase::Settled => None,
      Phase::Aborted => {
        self.phase = Phase::Settled;
        Some(Err(self.error.take().unwrap_or(BatchError::Cancelled)))
      }
      Phase::Running if self.finished == self.total && self.in_flight == 0 => {
        self.phase = Phase::Settled;
        Some(match self.error.take() {
          Some(error) => Err(error),
          None => Ok(std::mem::take(&mut self.results)),
        })
      }
      Phase::Running => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn failure(index: usize) -> BatchError<String> {
    BatchError::Processor {
      index,
      attempts: 1,
      error: format!("input {} failed", index),
    }
  }

  #[test]
  fn test_empty_batch_settles_immediately() {
    let mut tracker = CompletionTracker::<u32, String>::new(0, false);
    assert_eq!(tracker.settlement(), Some(Ok(Vec::new())));
    assert_eq!(tracker.settlement(), None);
  }

  #[test]
  fn test_settles_after_all_tasks_finish() {
    let mut tracker = CompletionTracker::<u32, String>::new(2, false);
    assert!(tracker.admit());
    assert!(tracker.admit());
    assert!(!tracker.admit(), "cannot admit more than the batch holds");
    assert_eq!(tracker.in_flight(), 2);

    assert!(tracker.record(Ok(2)));
    assert_eq!(tracker.settlement(), None);

    assert!(tracker.record(Ok(1)));
    assert_eq!(tracker.in_flight(), 0);
    assert_eq!(tracker.finished(), 2);
    // Completion order, not admission order.
    assert_eq!(tracker.settlement(), Some(Ok(vec![2, 1])));
    assert_eq!(tracker.phase(), Phase::Settled);
  }

  #[test]
  fn test_failure_without_stop_waits_for_every_task() {
    let mut tracker = CompletionTracker::<u32, String>::new(3, false);
    for _ in 0..3 {
      tracker.admit();
    }

    tracker.record(Err(failure(0)));
    assert!(tracker.is_running());
    assert_eq!(tracker.settlement(), None);

    tracker.record(Ok(1));
    tracker.record(Err(failure(2)));
    assert_eq!(tracker.settlement(), Some(Err(failure(2))), "last failure wins");
  }

  #[test]
  fn test_stop_on_failure_aborts_and_discards() {
    let mut tracker = CompletionTracker::<u32, String>::new(5, true);
    tracker.admit();
    tracker.admit();
    tracker.record(Ok(10));

    tracker.record(Err(failure(1)));
    assert_eq!(tracker.phase(), Phase::Aborted);
    assert_eq!(tracker.in_flight(), 0);
    assert!(!tracker.admit());
    assert!(!tracker.record(Ok(11)), "completions after abort are discarded");

    assert_eq!(tracker.settlement(), Some(Err(failure(1))));
    assert_eq!(tracker.settlement(), None);
  }

  #[test]
  fn test_cancel_overrides_recorded_error() {
    let mut tracker = CompletionTracker::<u32, String>::new(2, false);
    tracker.admit();
    tracker.record(Err(failure(0)));
    tracker.cancel();
    assert_eq!(tracker.settlement(), Some(Err(BatchError::Cancelled)));
  }

  #[test]
  fn test_peak_in_flight() {
    let mut tracker = CompletionTracker::<u32, String>::new(4, false);
    tracker.admit();
    tracker.admit();
    tracker.record(Ok(0));
    tracker.admit();
    tracker.admit();
    assert_eq!(tracker.peak_in_flight(), 3);
    assert_eq!(tracker.admitted(), 4);
  }
}
