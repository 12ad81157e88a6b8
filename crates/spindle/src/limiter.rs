// Concurrency Limiter: bounds the number of simultaneous in-flight fetches of one job.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

/// Fixed-capacity limiter shared by every fetch of a job.
///
/// Waiting callers are suspended, not blocked. Wake-up order is whatever the
/// semaphore gives; no FIFO guarantee is made to callers.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// A held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    inner: Arc<LimiterInner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyLimiter {
    /// Capacity is fixed for the lifetime of the limiter. Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(LimiterInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wait for a free slot, or until `token` is cancelled.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<LimiterPermit, DownloadError> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            permit = semaphore.acquire_owned() => permit,
        }
        .map_err(|_| DownloadError::internal("concurrency limiter closed"))?;

        let now = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);

        Ok(LimiterPermit {
            _permit: permit,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of slots held at once since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }
}
