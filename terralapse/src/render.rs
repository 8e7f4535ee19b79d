//! Frame composition.
//!
//! Turns a set of downloaded tiles for one date into a single frame
//! image. Tiles are pasted onto a black canvas at their grid offsets,
//! so gaps from failed tile units render as black rather than aborting
//! the frame.

use crate::coord::TileCoord;
use image::imageops::FilterType;
use image::{imageops, RgbImage};
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Native edge length of a raster tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Errors from composing a single frame.
#[derive(Debug, Error)]
pub enum RenderError {
    /// No tile could be decoded for this frame
    #[error("no usable tiles for frame")]
    Empty,

    /// Output could not be written
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Canvas encode failure
    #[error("frame encode error: {0}")]
    Encode(#[from] image::ImageError),

    /// Render task was aborted before finishing
    #[error("render task failed: {0}")]
    Task(String),
}

/// One tile available for composition.
#[derive(Debug, Clone)]
pub struct TileSource {
    pub tile: TileCoord,
    pub path: PathBuf,
}

/// Trait for frame composers.
///
/// Takes the tiles fetched for one date and produces a frame image at
/// `output`. Implementations tolerate missing or corrupt tiles; only a
/// frame with zero usable tiles is an error.
pub trait FrameRenderer: Send + Sync + 'static {
    /// Composes one frame.
    ///
    /// # Arguments
    ///
    /// * `tiles` - Tiles with on-disk paths; gaps are painted black
    /// * `output` - Destination path (PNG)
    /// * `width` - Optional downscale width, aspect preserved
    fn render(
        &self,
        tiles: Vec<TileSource>,
        output: PathBuf,
        width: Option<u32>,
    ) -> impl Future<Output = Result<PathBuf, RenderError>> + Send;
}

/// Composes frames by pasting tiles onto a black canvas.
///
/// Decoding and pixel work run on the blocking thread pool so frame
/// composition never stalls the async runtime.
#[derive(Debug, Default, Clone)]
pub struct MosaicRenderer;

impl MosaicRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous mosaic composition; runs under `spawn_blocking`.
    fn compose(
        tiles: &[TileSource],
        output: &Path,
        width: Option<u32>,
    ) -> Result<PathBuf, RenderError> {
        let Some(first) = tiles.first() else {
            return Err(RenderError::Empty);
        };

        let (mut min_x, mut min_y) = (first.tile.x, first.tile.y);
        let (mut max_x, mut max_y) = (first.tile.x, first.tile.y);
        for source in tiles {
            min_x = min_x.min(source.tile.x);
            min_y = min_y.min(source.tile.y);
            max_x = max_x.max(source.tile.x);
            max_y = max_y.max(source.tile.y);
        }

        let canvas_w = (max_x - min_x + 1) * TILE_SIZE;
        let canvas_h = (max_y - min_y + 1) * TILE_SIZE;
        let mut canvas = RgbImage::new(canvas_w, canvas_h);

        let mut pasted = 0usize;
        for source in tiles {
            let tile_img = match image::open(&source.path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    warn!(
                        path = %source.path.display(),
                        error = %e,
                        "skipping undecodable tile"
                    );
                    continue;
                }
            };
            let offset_x = i64::from((source.tile.x - min_x) * TILE_SIZE);
            let offset_y = i64::from((source.tile.y - min_y) * TILE_SIZE);
            imageops::overlay(&mut canvas, &tile_img, offset_x, offset_y);
            pasted += 1;
        }

        if pasted == 0 {
            return Err(RenderError::Empty);
        }

        let final_img = match width {
            Some(target_w) if target_w < canvas_w => {
                let target_h =
                    (u64::from(canvas_h) * u64::from(target_w) / u64::from(canvas_w)) as u32;
                imageops::resize(&canvas, target_w, target_h.max(1), FilterType::Lanczos3)
            }
            _ => canvas,
        };

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        final_img.save(output)?;

        debug!(
            output = %output.display(),
            tiles = pasted,
            width = final_img.width(),
            height = final_img.height(),
            "frame composed"
        );
        Ok(output.to_path_buf())
    }
}

impl FrameRenderer for MosaicRenderer {
    async fn render(
        &self,
        tiles: Vec<TileSource>,
        output: PathBuf,
        width: Option<u32>,
    ) -> Result<PathBuf, RenderError> {
        tokio::task::spawn_blocking(move || Self::compose(&tiles, &output, width))
            .await
            .map_err(|e| RenderError::Task(e.to_string()))?
    }
}
