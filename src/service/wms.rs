//! Web Map Service (WMS 1.3.0) adapter.

use super::{
    merge_params, OutputFormat, RequestOptions, ServiceAdapter, ServiceKind, TileRequest,
};
use crate::error::{Error, Result};
use crate::grid::TileGeometry;

/// Adapter for WMS `GetMap` tile requests.
#[derive(Debug, Clone)]
pub struct WmsAdapter {
    base_url: String,
    version: String,
    layers: Option<String>,
    output_format: OutputFormat,
    transparent: bool,
}

impl WmsAdapter {
    /// Create an adapter for a WMS endpoint. `layers` is the comma-joined
    /// layer list the service expects.
    pub fn new(base_url: impl Into<String>, layers: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches(&['/', '?'][..]).to_string(),
            version: "1.3.0".to_string(),
            layers,
            output_format: OutputFormat::Png,
            transparent: true,
        }
    }

    /// Override the protocol version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the default output format for requests.
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }
}

impl ServiceAdapter for WmsAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Wms
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn coverage_id(&self) -> Option<&str> {
        self.layers.as_deref()
    }

    fn build_tile_request(
        &self,
        tile: &TileGeometry,
        options: &RequestOptions,
    ) -> Result<TileRequest> {
        let layers = options
            .coverage_id
            .as_deref()
            .or(self.layers.as_deref())
            .ok_or(Error::MissingLayer)?;

        let format = options.output_format.unwrap_or(self.output_format);
        let crs = options.crs.unwrap_or(tile.crs);
        let bbox = tile.bbox;

        let params = vec![
            ("service".to_string(), "WMS".to_string()),
            ("version".to_string(), self.version.clone()),
            ("request".to_string(), "GetMap".to_string()),
            ("layers".to_string(), layers.to_string()),
            (
                "bbox".to_string(),
                format!("{},{},{},{}", bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y),
            ),
            ("width".to_string(), tile.width.to_string()),
            ("height".to_string(), tile.height.to_string()),
            ("format".to_string(), format.as_mime().to_string()),
            ("crs".to_string(), crs.as_code().to_string()),
            ("transparent".to_string(), self.transparent.to_string()),
        ];

        Ok(TileRequest {
            url: self.base_url.clone(),
            params: merge_params(params, &options.params),
            headers: options.headers.clone(),
            timeout: options.timeout,
            retries: options.retries,
            output_format: format,
            crs,
            bbox,
            width: tile.width,
            height: tile.height,
        })
    }
}
