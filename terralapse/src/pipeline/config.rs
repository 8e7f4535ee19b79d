//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrent tile fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;
/// Default fetch attempts per tile.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default backoff before the second attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
/// Default per-attempt request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wall-clock budget for one frame composition.
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(120);
/// Default wall-clock budget for one export encode.
pub const DEFAULT_ENCODE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default cap on tiles per frame; bounds memory and remote load.
pub const DEFAULT_MAX_TILES_PER_FRAME: usize = 256;
/// Default retention window for terminal job records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Configuration for the tile pipeline.
///
/// Groups the knobs shared by the ingest, frame and export stages,
/// providing sensible defaults while allowing customization.
///
/// # Example
///
/// ```
/// use terralapse::pipeline::PipelineConfig;
/// use std::time::Duration;
///
/// let config = PipelineConfig::new("/tmp/terralapse")
///     .with_max_concurrent_fetches(8)
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_millis(250));
/// assert_eq!(config.max_concurrent_fetches(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Root directory for tiles, frames and exports
    work_dir: PathBuf,
    /// Maximum concurrent fetches against the tile service
    max_concurrent_fetches: usize,
    /// Fetch attempts per tile before the unit fails
    max_attempts: u32,
    /// Backoff before the second attempt; doubles each retry
    base_delay: Duration,
    /// Per-attempt request timeout
    request_timeout: Duration,
    /// Budget for composing one frame
    render_timeout: Duration,
    /// Budget for one export encode
    encode_timeout: Duration,
    /// Cap on tiles per frame
    max_tiles_per_frame: usize,
    /// Age after which terminal job records are swept
    retention: Duration,
}

impl PipelineConfig {
    /// Creates a configuration with default values rooted at `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            encode_timeout: DEFAULT_ENCODE_TIMEOUT,
            max_tiles_per_frame: DEFAULT_MAX_TILES_PER_FRAME,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Sets the maximum number of concurrent fetches.
    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max;
        self
    }

    /// Sets the fetch attempt limit per tile.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the per-attempt request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the frame composition budget.
    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    /// Sets the export encode budget.
    pub fn with_encode_timeout(mut self, timeout: Duration) -> Self {
        self.encode_timeout = timeout;
        self
    }

    /// Sets the cap on tiles per frame.
    pub fn with_max_tiles_per_frame(mut self, max: usize) -> Self {
        self.max_tiles_per_frame = max;
        self
    }

    /// Sets the retention window for terminal job records.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Root directory for pipeline artifacts.
    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    /// Directory holding one subtree per job.
    pub fn job_dir(&self, job_id: &crate::job::JobId) -> PathBuf {
        self.work_dir.join(job_id.as_str())
    }

    /// Maximum concurrent fetches.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }

    /// Fetch attempts per tile.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base backoff delay.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Per-attempt request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Frame composition budget.
    pub fn render_timeout(&self) -> Duration {
        self.render_timeout
    }

    /// Export encode budget.
    pub fn encode_timeout(&self) -> Duration {
        self.encode_timeout
    }

    /// Cap on tiles per frame.
    pub fn max_tiles_per_frame(&self) -> usize {
        self.max_tiles_per_frame
    }

    /// Retention window for terminal records.
    pub fn retention(&self) -> Duration {
        self.retention
    }
}
