//! Protocol adapters that turn tile geometries into fetchable requests.
//!
//! Each OGC protocol (WCS, WMS, WMTS) implements [`ServiceAdapter`] and is
//! selected at configuration time through [`ServiceKind`]. Adapters are pure:
//! they build request descriptions and never perform I/O themselves.

mod wcs;
mod wms;
mod wmts;

pub use wcs::{CoverageDescription, CoverageSummary, ServiceCapabilities, WcsAdapter, WcsClient};
pub use wms::WmsAdapter;
pub use wmts::WmtsAdapter;

use crate::error::{Error, Result};
use crate::geo::{BoundingBox, Crs};
use crate::grid::TileGeometry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Wire formats a tile service can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    /// GeoTIFF raster.
    #[serde(rename = "image/tiff")]
    GeoTiff,

    /// PNG image.
    #[serde(rename = "image/png")]
    Png,

    /// NetCDF container.
    #[serde(rename = "application/netcdf")]
    NetCdf,

    /// Raw little-endian f32 grid.
    #[serde(rename = "application/octet-stream")]
    Binary,
}

impl OutputFormat {
    /// MIME string sent to the service and used as registry key.
    pub fn as_mime(&self) -> &'static str {
        match self {
            OutputFormat::GeoTiff => "image/tiff",
            OutputFormat::Png => "image/png",
            OutputFormat::NetCdf => "application/netcdf",
            OutputFormat::Binary => "application/octet-stream",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::GeoTiff
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "image/tiff" | "image/geotiff" | "geotiff" | "tiff" => Ok(OutputFormat::GeoTiff),
            "image/png" | "png" => Ok(OutputFormat::Png),
            "application/netcdf" | "netcdf" => Ok(OutputFormat::NetCdf),
            "application/octet-stream" | "binary" => Ok(OutputFormat::Binary),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// Supported service protocols. Dispatch is by this enum, fixed at
/// configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceKind {
    Wcs,
    Wms,
    Wmts,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKind::Wcs => "WCS",
            ServiceKind::Wms => "WMS",
            ServiceKind::Wmts => "WMTS",
        };
        f.write_str(name)
    }
}

impl FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WCS" => Ok(ServiceKind::Wcs),
            "WMS" => Ok(ServiceKind::Wms),
            "WMTS" => Ok(ServiceKind::Wmts),
            other => Err(Error::UnknownService(other.to_string())),
        }
    }
}

/// Infer the service protocol from a URL's query string or path.
pub fn detect_service_kind(url: &str) -> Result<ServiceKind> {
    // Query parameter wins when present: ...?service=WCS
    if let Some(query) = url.split_once('?').map(|(_, q)| q) {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key.eq_ignore_ascii_case("service") {
                    if let Ok(kind) = value.parse() {
                        return Ok(kind);
                    }
                }
            }
        }
    }

    let path = url.split_once('?').map(|(p, _)| p).unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    // "wmts" must be checked before "wms" since it contains it
    if lower.contains("wmts") {
        Ok(ServiceKind::Wmts)
    } else if lower.contains("wcs") {
        Ok(ServiceKind::Wcs)
    } else if lower.contains("wms") {
        Ok(ServiceKind::Wms)
    } else {
        Err(Error::UnknownService(url.to_string()))
    }
}

/// Fully describes one fetchable tile. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    /// Service endpoint URL (no query string).
    pub url: String,

    /// Ordered query parameters. Duplicate keys are legal (WCS subsets).
    pub params: Vec<(String, String)>,

    /// Extra HTTP headers.
    pub headers: Vec<(String, String)>,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Retry attempts after the first failure.
    pub retries: u32,

    /// Format the service was asked to return.
    pub output_format: OutputFormat,

    /// CRS of the request bounds.
    pub crs: Crs,

    /// Spatial extent requested.
    pub bbox: BoundingBox,

    /// Requested raster width in pixels.
    pub width: u32,

    /// Requested raster height in pixels.
    pub height: u32,
}

/// Per-request overrides and transport settings, with documented defaults.
///
/// Replaces the loosely-typed option dictionaries such pipelines often grow:
/// every field is named and validated once at the boundary.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Override the adapter's configured coverage/layer identifier.
    pub coverage_id: Option<String>,

    /// Override the adapter's configured output format.
    pub output_format: Option<OutputFormat>,

    /// Override the subsetting CRS (defaults to the tile's CRS).
    pub crs: Option<Crs>,

    /// Extra query parameters, merged last (last-write-wins over defaults).
    pub params: Vec<(String, String)>,

    /// Extra HTTP headers attached to every request.
    pub headers: Vec<(String, String)>,

    /// Per-request timeout. Default 30 seconds.
    pub timeout: Duration,

    /// Retry attempts after the first failure. Default 3.
    pub retries: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            coverage_id: None,
            output_format: None,
            crs: None,
            params: Vec::new(),
            headers: Vec::new(),
            timeout: Duration::from_secs(30),
            retries: 3,
        }
    }
}

/// Merge caller-supplied parameters into the protocol defaults.
///
/// Extras win: any default entry with a matching key is dropped first, so
/// a caller can override `format`, `version`, or even both WCS `subset`
/// expressions at once.
pub(crate) fn merge_params(
    mut defaults: Vec<(String, String)>,
    extras: &[(String, String)],
) -> Vec<(String, String)> {
    for (key, value) in extras {
        defaults.retain(|(k, _)| k != key);
        defaults.push((key.clone(), value.clone()));
    }
    defaults
}

/// Builds a protocol-specific request for one tile geometry.
pub trait ServiceAdapter: Send + Sync {
    /// The protocol this adapter speaks.
    fn kind(&self) -> ServiceKind;

    /// Service endpoint URL.
    fn base_url(&self) -> &str;

    /// Coverage/layer identifier this adapter is configured for, if any.
    fn coverage_id(&self) -> Option<&str>;

    /// Turn one tile geometry into a fetchable request.
    fn build_tile_request(
        &self,
        tile: &TileGeometry,
        options: &RequestOptions,
    ) -> Result<TileRequest>;
}
