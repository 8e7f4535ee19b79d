//! Tile source providers.
//!
//! A [`TileProvider`] turns a `(layer, date, tile)` triple into image
//! bytes. The only production implementation is [`GibsProvider`], which
//! speaks the NASA GIBS WMTS REST dialect; tests substitute mocks at the
//! [`HttpFetch`] or [`TileProvider`] seam.

pub mod gibs;
pub mod http;

pub use gibs::{GibsProvider, DEFAULT_BASE_URL};
pub use http::{HttpFetch, ReqwestFetch};

use crate::coord::TileCoord;
use chrono::NaiveDate;
use std::future::Future;
use thiserror::Error;

/// Errors from a single fetch attempt against the tile source.
///
/// The pipeline does not distinguish transient from permanent failures:
/// every variant consumes a retry attempt and, once attempts are
/// exhausted, is recorded as a unit failure rather than raised.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Transport-level failure (connection reset, DNS, read error)
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP status
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// The attempt exceeded its timeout
    #[error("request timed out")]
    Timeout,

    /// HTTP client could not be constructed
    #[error("client error: {0}")]
    Client(String),

    /// All retry attempts were consumed
    #[error("fetch failed after {attempts} attempts: {cause}")]
    Exhausted { attempts: u32, cause: String },
}

/// Trait for async tile providers.
///
/// Implementations download a single raster tile for a named layer on a
/// given date. Requests must be idempotent (GET semantics) so the
/// retrying fetcher can safely re-issue them.
pub trait TileProvider: Send + Sync + 'static {
    /// Downloads one tile.
    ///
    /// # Arguments
    ///
    /// * `layer` - Remote layer identifier
    /// * `date` - Imagery date
    /// * `tile` - Tile address at the requested zoom
    fn fetch_tile(
        &self,
        layer: &str,
        date: NaiveDate,
        tile: &TileCoord,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;

    /// Returns the provider name for logging.
    fn name(&self) -> &str;

    /// Returns the image file extension served for a layer.
    fn tile_extension(&self, layer: &str) -> &'static str {
        let _ = layer;
        "jpg"
    }
}
