//! Global budget for bytes buffered in flight
//!
//! Every transfer reserves the size of the chunk it is about to read before
//! reading it and releases the reservation once the chunk is on disk. When the
//! budget is exhausted, readers wait (backpressure) instead of dropping data.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Error, Result};

/// Shared byte budget, one semaphore permit per byte
///
/// Cloning is cheap and clones draw from the same budget.
#[derive(Clone, Debug)]
pub struct MemoryGuard {
    semaphore: Arc<Semaphore>,
    budget: u32,
}

/// Bytes held against a [`MemoryGuard`] budget, returned when dropped
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct MemoryReservation {
    _permit: OwnedSemaphorePermit,
    bytes: usize,
}

impl MemoryReservation {
    /// Number of bytes held
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Return the bytes to the budget
    pub fn release(self) {}
}

impl MemoryGuard {
    /// Create a guard with `budget_bytes` available
    ///
    /// Budgets above `u32::MAX` bytes are capped there.
    pub fn new(budget_bytes: usize) -> Self {
        let budget = u32::try_from(budget_bytes).unwrap_or(u32::MAX);
        Self {
            semaphore: Arc::new(Semaphore::new(budget as usize)),
            budget,
        }
    }

    /// Clamp a request so that it can always be granted eventually
    fn permits_for(&self, bytes: usize) -> u32 {
        let clamped = u32::try_from(bytes).unwrap_or(u32::MAX).min(self.budget);
        if (clamped as usize) < bytes {
            tracing::debug!(
                requested = bytes,
                budget = self.budget,
                "memory reservation clamped to budget"
            );
        }
        clamped
    }

    /// Wait until `bytes` fit the budget and hold them
    pub async fn reserve(&self, bytes: usize) -> Result<MemoryReservation> {
        let permits = self.permits_for(bytes);
        let permit = Arc::clone(&self.semaphore)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| Error::Other("memory guard closed".into()))?;

        Ok(MemoryReservation {
            _permit: permit,
            bytes: permits as usize,
        })
    }

    /// Hold `bytes` only if they fit right now
    ///
    /// `None` means the caller must shed: flush what it already buffers and
    /// ask again.
    pub fn try_reserve(&self, bytes: usize) -> Option<MemoryReservation> {
        let permits = self.permits_for(bytes);
        match Arc::clone(&self.semaphore).try_acquire_many_owned(permits) {
            Ok(permit) => Some(MemoryReservation {
                _permit: permit,
                bytes: permits as usize,
            }),
            Err(TryAcquireError::NoPermits) => {
                tracing::trace!(
                    requested = bytes,
                    available = self.available(),
                    "memory budget exhausted"
                );
                None
            }
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Total budget in bytes
    pub fn budget(&self) -> usize {
        self.budget as usize
    }

    /// Bytes currently reserved
    pub fn in_use(&self) -> usize {
        self.budget().saturating_sub(self.available())
    }

    /// Bytes that can be reserved without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
