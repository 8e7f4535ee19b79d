//! Concurrency limiter for tile fetches.
//!
//! A configurable semaphore-based limiter that bounds the number of
//! in-flight requests against the remote tile service. Waiters queue in
//! FIFO order; there is no priority or preemption. The bound here exists
//! to be polite to a rate-limited external endpoint, so it is sized by
//! explicit configuration rather than local CPU count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent fetches.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Semaphore-based concurrency limiter.
///
/// Wraps a Tokio semaphore to limit the total number of concurrent
/// operations, with in-flight and peak counters for tests and stats.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    /// Semaphore controlling concurrent operations
    semaphore: Arc<Semaphore>,

    /// Maximum permits (for stats/debugging)
    max_permits: usize,

    /// Current number of in-flight operations
    in_flight: AtomicUsize,

    /// Peak concurrent operations observed (for tuning)
    peak_in_flight: AtomicUsize,
}

impl ConcurrencyLimiter {
    /// Creates a new limiter with the specified maximum concurrent operations.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrent` is 0.
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent > 0, "max_concurrent must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_permits: max_concurrent,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Acquires a permit, waiting FIFO if the limit is reached.
    ///
    /// The permit is released when dropped.
    pub async fn acquire(&self) -> ConcurrencyPermit<'_> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed unexpectedly");

        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_peak(current);

        ConcurrencyPermit {
            _permit: permit,
            in_flight: &self.in_flight,
        }
    }

    /// Updates the peak counter if current exceeds it.
    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_in_flight.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_in_flight.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    /// Returns the maximum number of concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_permits
    }

    /// Returns the current number of in-flight operations.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Returns the peak number of concurrent operations observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Returns the number of available permits.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

/// A permit for performing a concurrent operation.
///
/// While held, it counts against the limiter's concurrency limit.
pub struct ConcurrencyPermit<'a> {
    _permit: OwnedSemaphorePermit,
    in_flight: &'a AtomicUsize,
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_limiter() {
        let limiter = ConcurrencyLimiter::new(8);
        assert_eq!(limiter.max_concurrent(), 8);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.available_permits(), 8);
    }

    #[test]
    #[should_panic(expected = "max_concurrent must be > 0")]
    fn test_zero_concurrency_panics() {
        ConcurrencyLimiter::new(0);
    }

    #[tokio::test]
    async fn test_acquire_releases_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);

        {
            let _permit1 = limiter.acquire().await;
            assert_eq!(limiter.available_permits(), 1);
            assert_eq!(limiter.in_flight(), 1);

            {
                let _permit2 = limiter.acquire().await;
                assert_eq!(limiter.available_permits(), 0);
                assert_eq!(limiter.in_flight(), 2);
            }

            assert_eq!(limiter.available_permits(), 1);
            assert_eq!(limiter.in_flight(), 1);
        }

        assert_eq!(limiter.available_permits(), 2);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_peak_tracking() {
        let limiter = ConcurrencyLimiter::new(10);

        let p1 = limiter.acquire().await;
        let p2 = limiter.acquire().await;
        let p3 = limiter.acquire().await;
        assert_eq!(limiter.peak_in_flight(), 3);

        drop(p3);
        drop(p2);
        drop(p1);

        // Peak persists after release
        assert_eq!(limiter.peak_in_flight(), 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let limiter = Arc::new(ConcurrencyLimiter::new(3));
        let mut handles = Vec::new();

        for _ in 0..12 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(limiter.peak_in_flight() <= 3);
        assert_eq!(limiter.in_flight(), 0);
    }
}
