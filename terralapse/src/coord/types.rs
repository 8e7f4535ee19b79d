//! Coordinate types shared across the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum latitude supported by the Web Mercator projection.
pub const MIN_LAT: f64 = -85.05112878;

/// Maximum latitude supported by the Web Mercator projection.
pub const MAX_LAT: f64 = 85.05112878;

/// Minimum longitude in degrees.
pub const MIN_LON: f64 = -180.0;

/// Maximum longitude in degrees.
pub const MAX_LON: f64 = 180.0;

/// Minimum supported zoom level.
pub const MIN_ZOOM: u8 = 0;

/// Maximum supported zoom level.
///
/// GIBS serves most raster layers up to zoom 9; higher levels are
/// rejected during validation rather than producing 404 storms.
pub const MAX_ZOOM: u8 = 9;

/// A single tile address in the slippy-map grid.
///
/// `x` increases west to east, `y` increases north to south. Both are
/// bounded by `2^zoom - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    /// Column in the tile grid (west to east)
    pub x: u32,
    /// Row in the tile grid (north to south)
    pub y: u32,
    /// Zoom level
    pub zoom: u8,
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "z{}_x{}_y{}", self.zoom, self.x, self.y)
    }
}

/// A geographic rectangle in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Northern edge latitude
    pub north: f64,
    /// Southern edge latitude
    pub south: f64,
    /// Eastern edge longitude
    pub east: f64,
    /// Western edge longitude
    pub west: f64,
}

impl BoundingBox {
    /// Creates a bounding box, validating edge ordering and projection limits.
    ///
    /// # Errors
    ///
    /// Returns `CoordError` if north <= south, east <= west, or any edge
    /// falls outside the Web Mercator limits.
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self, CoordError> {
        if !(MIN_LAT..=MAX_LAT).contains(&north) {
            return Err(CoordError::InvalidLatitude(north));
        }
        if !(MIN_LAT..=MAX_LAT).contains(&south) {
            return Err(CoordError::InvalidLatitude(south));
        }
        if !(MIN_LON..=MAX_LON).contains(&east) {
            return Err(CoordError::InvalidLongitude(east));
        }
        if !(MIN_LON..=MAX_LON).contains(&west) {
            return Err(CoordError::InvalidLongitude(west));
        }
        if north <= south {
            return Err(CoordError::EmptyBox {
                axis: "latitude",
                low: south,
                high: north,
            });
        }
        if east <= west {
            return Err(CoordError::EmptyBox {
                axis: "longitude",
                low: west,
                high: east,
            });
        }
        Ok(Self {
            north,
            south,
            east,
            west,
        })
    }
}

/// Errors from coordinate validation and conversion.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordError {
    /// Latitude outside the Web Mercator range
    #[error("latitude {0} outside supported range ({MIN_LAT} to {MAX_LAT})")]
    InvalidLatitude(f64),

    /// Longitude outside -180..180
    #[error("longitude {0} outside supported range ({MIN_LON} to {MAX_LON})")]
    InvalidLongitude(f64),

    /// Zoom level outside the supported range
    #[error("zoom level {0} outside supported range ({MIN_ZOOM} to {MAX_ZOOM})")]
    InvalidZoom(u8),

    /// Bounding box with inverted or equal edges
    #[error("empty bounding box on {axis} axis: {low} to {high}")]
    EmptyBox {
        axis: &'static str,
        low: f64,
        high: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_valid() {
        let bbox = BoundingBox::new(45.0, 35.0, -110.0, -120.0).unwrap();
        assert_eq!(bbox.north, 45.0);
        assert_eq!(bbox.west, -120.0);
    }

    #[test]
    fn test_bbox_inverted_latitude() {
        let err = BoundingBox::new(35.0, 45.0, -110.0, -120.0).unwrap_err();
        assert!(matches!(err, CoordError::EmptyBox { axis: "latitude", .. }));
    }

    #[test]
    fn test_bbox_inverted_longitude() {
        let err = BoundingBox::new(45.0, 35.0, -120.0, -110.0).unwrap_err();
        assert!(matches!(
            err,
            CoordError::EmptyBox {
                axis: "longitude",
                ..
            }
        ));
    }

    #[test]
    fn test_bbox_out_of_range() {
        assert!(BoundingBox::new(90.0, 35.0, -110.0, -120.0).is_err());
        assert!(BoundingBox::new(45.0, 35.0, 200.0, -120.0).is_err());
    }

    #[test]
    fn test_tile_coord_display() {
        let tile = TileCoord { x: 3, y: 7, zoom: 5 };
        assert_eq!(tile.to_string(), "z5_x3_y7");
    }
}
