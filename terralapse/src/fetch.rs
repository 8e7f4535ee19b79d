//! Retrying tile fetcher.
//!
//! Wraps a [`TileProvider`] call with bounded retries, per-attempt
//! timeout and exponential backoff. Exhaustion is a normal, expected
//! outcome for callers: a failed unit is recorded, never raised.

use crate::coord::TileCoord;
use crate::provider::{FetchError, TileProvider};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default number of attempts per tile.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff before the second attempt; doubles each retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default per-attempt timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches a single remote tile with bounded retries and backoff.
///
/// The fetcher is cheap to clone and shared across all download workers
/// of a batch.
pub struct RetryingFetcher<P: TileProvider> {
    provider: Arc<P>,
    max_attempts: u32,
    base_delay: Duration,
    request_timeout: Duration,
}

impl<P: TileProvider> Clone for RetryingFetcher<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            request_timeout: self.request_timeout,
        }
    }
}

impl<P: TileProvider> RetryingFetcher<P> {
    /// Creates a fetcher with default retry settings.
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the attempt limit (builder pattern).
    ///
    /// # Panics
    ///
    /// Panics if `max_attempts` is 0.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "max_attempts must be > 0");
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base backoff delay (builder pattern).
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the per-attempt timeout (builder pattern).
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Returns the configured attempt limit.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fetches one tile, retrying on any failure.
    ///
    /// Attempt `n` (1-based) is followed by a `base_delay * 2^(n-1)`
    /// backoff sleep before attempt `n+1`. A hung request is aborted by
    /// the per-attempt timeout and counts as a failed attempt. The
    /// cancellation token is observed before each attempt, during the
    /// attempt itself and during backoff; an attempt aborted in flight
    /// by cancellation is not counted in the reported attempt total.
    ///
    /// # Returns
    ///
    /// Tile bytes, or `FetchError::Exhausted` carrying the attempt count
    /// and last underlying cause.
    pub async fn fetch(
        &self,
        layer: &str,
        date: NaiveDate,
        tile: &TileCoord,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let mut last_error = String::from("not attempted");

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Exhausted {
                    attempts: attempt - 1,
                    cause: "cancelled".to_string(),
                });
            }

            trace!(
                layer = layer,
                date = %date,
                tile = %tile,
                attempt = attempt,
                "fetch attempt starting"
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // The aborted in-flight attempt never completed,
                    // so it does not count
                    return Err(FetchError::Exhausted {
                        attempts: attempt - 1,
                        cause: "cancelled during fetch".to_string(),
                    });
                }
                result = tokio::time::timeout(
                    self.request_timeout,
                    self.provider.fetch_tile(layer, date, tile),
                ) => result,
            };

            match result {
                Ok(Ok(bytes)) => {
                    trace!(tile = %tile, bytes = bytes.len(), "fetch succeeded");
                    return Ok(bytes);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    debug!(
                        tile = %tile,
                        attempt = attempt,
                        error = %e,
                        "fetch attempt failed"
                    );
                }
                Err(_) => {
                    last_error = FetchError::Timeout.to_string();
                    debug!(tile = %tile, attempt = attempt, "fetch attempt timed out");
                }
            }

            // Exponential backoff before the next attempt
            if attempt < self.max_attempts {
                let backoff = self.base_delay * 2u32.pow(attempt - 1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(FetchError::Exhausted {
                            attempts: attempt,
                            cause: "cancelled during backoff".to_string(),
                        });
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.max_attempts,
            cause: last_error,
        })
    }
}
