//! Coordinate conversion module
//!
//! Provides conversions between geographic coordinates (latitude/longitude)
//! and slippy-map tile coordinates, plus expansion of a bounding box into
//! the grid of tiles that covers it at a given zoom level.

mod types;

pub use types::{
    BoundingBox, CoordError, TileCoord, MAX_LAT, MAX_LON, MAX_ZOOM, MIN_LAT, MIN_LON, MIN_ZOOM,
};

use std::f64::consts::PI;

/// Converts geographic coordinates to tile coordinates.
///
/// # Arguments
///
/// * `lat` - Latitude in degrees (-85.05112878 to 85.05112878)
/// * `lon` - Longitude in degrees (-180.0 to 180.0)
/// * `zoom` - Zoom level (0 to 9)
///
/// # Returns
///
/// A `Result` containing the tile coordinates or an error if inputs are invalid.
#[inline]
pub fn to_tile_coords(lat: f64, lon: f64, zoom: u8) -> Result<TileCoord, CoordError> {
    if !(MIN_LAT..=MAX_LAT).contains(&lat) {
        return Err(CoordError::InvalidLatitude(lat));
    }
    if !(MIN_LON..=MAX_LON).contains(&lon) {
        return Err(CoordError::InvalidLongitude(lon));
    }
    if zoom > MAX_ZOOM {
        return Err(CoordError::InvalidZoom(zoom));
    }

    let n = 2.0_f64.powi(zoom as i32);

    // Longitude maps linearly to the X axis
    let x = ((lon + 180.0) / 360.0 * n) as u32;

    // Latitude maps through the Web Mercator projection to the Y axis
    let lat_rad = lat * PI / 180.0;
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n) as u32;

    // Clamp to the grid; lat/lon exactly on the antimeridian or pole
    // limit would otherwise produce an out-of-range index
    let max_index = (n as u32).saturating_sub(1);
    Ok(TileCoord {
        x: x.min(max_index),
        y: y.min(max_index),
        zoom,
    })
}

/// Converts tile coordinates back to geographic coordinates.
///
/// Returns the latitude/longitude of the tile's northwest corner.
#[inline]
pub fn tile_to_lat_lon(tile: &TileCoord) -> (f64, f64) {
    let n = 2.0_f64.powi(tile.zoom as i32);

    let lon = tile.x as f64 / n * 360.0 - 180.0;

    let y = tile.y as f64 / n;
    let lat_rad = (PI * (1.0 - 2.0 * y)).sinh().atan();
    let lat = lat_rad * 180.0 / PI;

    (lat, lon)
}

/// Expands a bounding box into the row-major list of tiles covering it.
///
/// The northwest corner of the box yields the minimum x / minimum y tile
/// and the southeast corner the maximums (y grows southward). The list is
/// truncated at `max_tiles` to bound request volume against the remote
/// service.
///
/// # Arguments
///
/// * `bbox` - Geographic extent to cover
/// * `zoom` - Zoom level (0 to 9)
/// * `max_tiles` - Upper bound on the number of tiles returned
pub fn tiles_for_bbox(
    bbox: &BoundingBox,
    zoom: u8,
    max_tiles: usize,
) -> Result<Vec<TileCoord>, CoordError> {
    let nw = to_tile_coords(bbox.north, bbox.west, zoom)?;
    let se = to_tile_coords(bbox.south, bbox.east, zoom)?;

    let mut tiles = Vec::new();
    'outer: for y in nw.y..=se.y {
        for x in nw.x..=se.x {
            if tiles.len() >= max_tiles {
                break 'outer;
            }
            tiles.push(TileCoord { x, y, zoom });
        }
    }
    Ok(tiles)
}
