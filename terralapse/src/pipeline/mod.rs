//! Tile pipeline: configuration and batch downloading.

mod batch;
mod config;

pub use batch::{BatchError, BatchOutcome, TileBatchDownloader};
pub use config::{
    PipelineConfig, DEFAULT_BASE_DELAY, DEFAULT_ENCODE_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_MAX_TILES_PER_FRAME, DEFAULT_RENDER_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETENTION,
};
