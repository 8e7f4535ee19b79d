//! NASA GIBS WMTS tile provider.
//!
//! Builds REST-style WMTS URLs for the GIBS imagery endpoint:
//!
//! `{base}/{layer}/default/{date}/{resolution}/{z}/{y}/{x}.{ext}`
//!
//! Resolution and image format vary per layer; well-known Terra layers
//! are mapped explicitly and anything unrecognized falls back to
//! 250m JPEG, which covers the corrected-reflectance family.

use crate::coord::TileCoord;
use crate::provider::{FetchError, HttpFetch, TileProvider};
use chrono::NaiveDate;

/// Default GIBS WMTS endpoint (EPSG:4326, best available imagery).
pub const DEFAULT_BASE_URL: &str = "https://gibs.earthdata.nasa.gov/wmts/epsg4326/best";

/// Per-layer tile matrix resolution and image format.
///
/// GIBS publishes each layer at a fixed native resolution; requesting
/// the wrong one returns 404 for every tile.
fn layer_profile(layer: &str) -> (&'static str, &'static str) {
    match layer {
        "MODIS_Terra_CorrectedReflectance_TrueColor" => ("250m", "jpg"),
        "MODIS_Terra_CorrectedReflectance_Bands721" => ("500m", "jpg"),
        "MODIS_Terra_CorrectedReflectance_Bands367" => ("500m", "jpg"),
        "MODIS_Terra_SurfaceReflectance_Bands121" => ("500m", "jpg"),
        "MODIS_Aqua_CorrectedReflectance_TrueColor" => ("250m", "jpg"),
        "VIIRS_SNPP_CorrectedReflectance_TrueColor" => ("250m", "jpg"),
        "MODIS_Terra_Aerosol" => ("1km", "png"),
        "MODIS_Terra_Chlorophyll_A" => ("4km", "png"),
        _ => ("250m", "jpg"),
    }
}

/// GIBS WMTS imagery provider.
///
/// Generic over the HTTP client so tests can inject a mock.
pub struct GibsProvider<C: HttpFetch> {
    http: C,
    base_url: String,
}

impl<C: HttpFetch> GibsProvider<C> {
    /// Creates a provider against the public GIBS endpoint.
    pub fn new(http: C) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    /// Creates a provider against a custom endpoint (test servers, mirrors).
    pub fn with_base_url(http: C, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    /// Builds the WMTS tile URL for a layer, date and tile address.
    pub fn tile_url(&self, layer: &str, date: NaiveDate, tile: &TileCoord) -> String {
        let (resolution, ext) = layer_profile(layer);
        format!(
            "{}/{}/default/{}/{}/{}/{}/{}.{}",
            self.base_url,
            layer,
            date.format("%Y-%m-%d"),
            resolution,
            tile.zoom,
            tile.y,
            tile.x,
            ext
        )
    }

}

impl<C: HttpFetch> TileProvider for GibsProvider<C> {
    async fn fetch_tile(
        &self,
        layer: &str,
        date: NaiveDate,
        tile: &TileCoord,
    ) -> Result<Vec<u8>, FetchError> {
        let url = self.tile_url(layer, date, tile);
        self.http.get(&url).await
    }

    fn name(&self) -> &str {
        "NASA GIBS"
    }

    fn tile_extension(&self, layer: &str) -> &'static str {
        layer_profile(layer).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::http::tests::MockHttpFetch;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_true_color_url() {
        let provider = GibsProvider::new(MockHttpFetch::ok(vec![]));
        let tile = TileCoord { x: 3, y: 1, zoom: 2 };
        let url = provider.tile_url(
            "MODIS_Terra_CorrectedReflectance_TrueColor",
            date("2024-01-15"),
            &tile,
        );
        assert_eq!(
            url,
            "https://gibs.earthdata.nasa.gov/wmts/epsg4326/best/\
             MODIS_Terra_CorrectedReflectance_TrueColor/default/2024-01-15/250m/2/1/3.jpg"
        );
    }

    #[test]
    fn test_png_layer_url() {
        let provider = GibsProvider::new(MockHttpFetch::ok(vec![]));
        let tile = TileCoord { x: 0, y: 0, zoom: 1 };
        let url = provider.tile_url("MODIS_Terra_Aerosol", date("2024-06-01"), &tile);
        assert!(url.contains("/1km/"));
        assert!(url.ends_with(".png"));
    }

    #[test]
    fn test_unknown_layer_falls_back() {
        let provider = GibsProvider::new(MockHttpFetch::ok(vec![]));
        assert_eq!(provider.tile_extension("Some_Future_Layer"), "jpg");
        assert_eq!(provider.tile_extension("MODIS_Terra_Aerosol"), "png");
    }

    #[test]
    fn test_custom_base_url_trailing_slash() {
        let provider =
            GibsProvider::with_base_url(MockHttpFetch::ok(vec![]), "http://localhost:9090/");
        let tile = TileCoord { x: 0, y: 0, zoom: 0 };
        let url = provider.tile_url("MODIS_Terra_Fires", date("2024-01-01"), &tile);
        assert!(url.starts_with("http://localhost:9090/MODIS_Terra_Fires/"));
    }

    #[tokio::test]
    async fn test_fetch_tile_delegates_to_http() {
        let mock = MockHttpFetch::ok(vec![0xFF, 0xD8]);
        let provider = GibsProvider::new(mock.clone());
        let tile = TileCoord { x: 1, y: 1, zoom: 2 };
        let bytes = provider
            .fetch_tile(
                "MODIS_Terra_CorrectedReflectance_TrueColor",
                date("2024-01-01"),
                &tile,
            )
            .await
            .unwrap();
        assert_eq!(bytes, vec![0xFF, 0xD8]);
        assert_eq!(mock.call_count(), 1);
    }
}
