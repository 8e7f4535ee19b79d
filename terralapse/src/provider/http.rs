//! HTTP client abstraction for testability

use super::FetchError;
use std::future::Future;
use tracing::{debug, trace, warn};

/// Trait for asynchronous HTTP GET operations.
///
/// This abstraction allows for dependency injection and easier testing
/// by enabling mock HTTP clients in tests. All pipeline requests are
/// idempotent GETs, so retrying a failed call is always safe.
pub trait HttpFetch: Send + Sync + 'static {
    /// Performs an async HTTP GET request.
    ///
    /// # Arguments
    ///
    /// * `url` - The URL to request
    ///
    /// # Returns
    ///
    /// The response body as bytes or an error.
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Default User-Agent string for HTTP requests.
const DEFAULT_USER_AGENT: &str = "terralapse/0.3 (+https://github.com/terralapse/terralapse)";

/// Async HTTP client implementation using reqwest.
///
/// Tuned for bulk tile download against a single host: warm connection
/// pool, TCP keepalive and nodelay.
#[derive(Clone)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    /// Creates a new client with the default 30 second timeout.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(std::time::Duration::from_secs(30))
    }

    /// Creates a new client with a custom per-request timeout.
    pub fn with_timeout(timeout: std::time::Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| FetchError::Client(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        trace!(url = url, "HTTP GET request starting");

        let response = match self.client.get(url).send().await {
            Ok(resp) => {
                debug!(
                    url = url,
                    status = resp.status().as_u16(),
                    "HTTP response received"
                );
                resp
            }
            Err(e) => {
                warn!(
                    url = url,
                    error = %e,
                    is_connect = e.is_connect(),
                    is_timeout = e.is_timeout(),
                    "HTTP request failed"
                );
                return Err(FetchError::Transport(format!("request failed: {}", e)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url = url, status = status.as_u16(), "HTTP error status");
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        match response.bytes().await {
            Ok(bytes) => {
                trace!(url = url, bytes = bytes.len(), "HTTP response body read");
                Ok(bytes.to_vec())
            }
            Err(e) => Err(FetchError::Transport(format!(
                "failed to read response: {}",
                e
            ))),
        }
    }
}
