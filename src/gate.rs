use std::fmt;
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Largest number of slots a gate can hold.
pub(crate) const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// Counting gate that holds the batch to at most `capacity` admitted tasks.
///
/// `acquire` resolves immediately while a slot is free and otherwise waits until a
/// [`SlotPermit`] is dropped. Each release wakes one waiter.
pub(crate) struct AdmissionGate {
  semaphore: Arc<Semaphore>,
  capacity: usize,
}

/// One occupied slot. Dropping it releases the slot back to the gate.
pub(crate) struct SlotPermit {
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for SlotPermit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlotPermit").finish_non_exhaustive()
  }
}

impl fmt::Debug for AdmissionGate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AdmissionGate")
      .field("capacity", &self.capacity)
      .field("available", &self.available())
      .finish()
  }
}

impl AdmissionGate {
  pub(crate) fn new(capacity: usize) -> Self {
    let capacity = capacity.clamp(1, MAX_CAPACITY);
    Self {
      semaphore: Arc::new(Semaphore::new(capacity)),
      capacity,
    }
  }

  /// Waits for a free slot. Cancel-safe: dropping the future gives up the place in line.
  pub(crate) async fn acquire(&self) -> Result<SlotPermit, AcquireError> {
    let permit = self.semaphore.clone().acquire_owned().await?;
    Ok(SlotPermit { _permit: permit })
  }

  pub(crate) fn available(&self) -> usize {
    self.semaphore.available_permits()
  }

  #[cfg(test)]
  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }
}
