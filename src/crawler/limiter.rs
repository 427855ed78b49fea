use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Process-wide pool of in-flight slots shared by every crawler.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One acquired slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl ResourceLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Non-blocking acquisition; None when every slot is taken
    pub fn try_acquire(&self) -> Option<Slot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(Slot { _permit: permit }),
            Err(_) => {
                trace!("No free resource slot ({} in use)", self.capacity);
                None
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
