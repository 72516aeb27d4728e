//! Web Map Tile Service (WMTS 1.0.0) adapter.
//!
//! WMTS serves pre-cut tiles addressed by (matrix, row, col) rather than by
//! bbox, so the adapter maps each tile geometry onto the configured matrix:
//! the column comes from the offset to the grid origin divided by the tile's
//! own ground span, the row likewise from the top edge downward.

use super::{
    merge_params, OutputFormat, RequestOptions, ServiceAdapter, ServiceKind, TileRequest,
};
use crate::error::{Error, Result};
use crate::grid::TileGeometry;

/// Adapter for WMTS `GetTile` requests.
#[derive(Debug, Clone)]
pub struct WmtsAdapter {
    base_url: String,
    version: String,
    layer: Option<String>,
    tile_matrix_set: Option<String>,
    tile_matrix: String,
    /// Top-left corner of the tile matrix (x, y). Defaults to the WGS84
    /// global grid origin (-180, 90).
    matrix_origin: (f64, f64),
    output_format: OutputFormat,
}

impl WmtsAdapter {
    /// Create an adapter for a WMTS endpoint.
    pub fn new(
        base_url: impl Into<String>,
        layer: Option<String>,
        tile_matrix_set: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches(&['/', '?'][..]).to_string(),
            version: "1.0.0".to_string(),
            layer,
            tile_matrix_set,
            tile_matrix: "0".to_string(),
            matrix_origin: (-180.0, 90.0),
            output_format: OutputFormat::Png,
        }
    }

    /// Select the tile matrix (zoom level) identifier.
    pub fn with_tile_matrix(mut self, matrix: impl Into<String>) -> Self {
        self.tile_matrix = matrix.into();
        self
    }

    /// Override the matrix origin (top-left corner in tile CRS units).
    pub fn with_matrix_origin(mut self, x: f64, y: f64) -> Self {
        self.matrix_origin = (x, y);
        self
    }

    /// Set the default output format for requests.
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }
}

impl ServiceAdapter for WmtsAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Wmts
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn coverage_id(&self) -> Option<&str> {
        self.layer.as_deref()
    }

    fn build_tile_request(
        &self,
        tile: &TileGeometry,
        options: &RequestOptions,
    ) -> Result<TileRequest> {
        let layer = options
            .coverage_id
            .as_deref()
            .or(self.layer.as_deref())
            .ok_or(Error::MissingLayer)?;
        let matrix_set = self
            .tile_matrix_set
            .as_deref()
            .ok_or(Error::MissingTileMatrixSet)?;

        let format = options.output_format.unwrap_or(self.output_format);
        let crs = options.crs.unwrap_or(tile.crs);
        let (origin_x, origin_y) = self.matrix_origin;

        // Address within the matrix; rows count downward from the top edge
        let tile_col = ((tile.bbox.min_x - origin_x) / tile.bbox.width()).round() as i64;
        let tile_row = ((origin_y - tile.bbox.max_y) / tile.bbox.height()).round() as i64;
        if tile_col < 0 || tile_row < 0 {
            return Err(Error::InvalidGrid(format!(
                "tile {} lies outside the matrix origin ({}, {})",
                tile.bbox, origin_x, origin_y
            )));
        }

        let params = vec![
            ("service".to_string(), "WMTS".to_string()),
            ("version".to_string(), self.version.clone()),
            ("request".to_string(), "GetTile".to_string()),
            ("layer".to_string(), layer.to_string()),
            ("tilematrixset".to_string(), matrix_set.to_string()),
            ("tilematrix".to_string(), self.tile_matrix.clone()),
            ("tilerow".to_string(), tile_row.to_string()),
            ("tilecol".to_string(), tile_col.to_string()),
            ("format".to_string(), format.as_mime().to_string()),
        ];

        Ok(TileRequest {
            url: self.base_url.clone(),
            params: merge_params(params, &options.params),
            headers: options.headers.clone(),
            timeout: options.timeout,
            retries: options.retries,
            output_format: format,
            crs,
            bbox: tile.bbox,
            width: tile.width,
            height: tile.height,
        })
    }
}
