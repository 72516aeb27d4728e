//! Configuration for tile array loads.

use crate::error::{Error, Result};
use crate::geo::{BoundingBox, Crs};
use crate::grid::GridSpec;
use crate::service::{
    detect_service_kind, OutputFormat, RequestOptions, ServiceAdapter, ServiceKind, WcsAdapter,
    WmsAdapter, WmtsAdapter,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a tile array load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Service endpoint configuration
    pub service: ServiceConfig,

    /// Area of interest [min_x, min_y, max_x, max_y] in the service CRS
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,

    /// Grid partition configuration
    #[serde(default)]
    pub grid: GridConfig,

    /// Fetching and caching configuration
    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Remote service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service endpoint URL
    pub url: String,

    /// Protocol; detected from the URL when omitted
    #[serde(default)]
    pub kind: Option<ServiceKind>,

    /// Coverage identifier (WCS)
    #[serde(default)]
    pub coverage_id: Option<String>,

    /// Layer name(s), comma-joined (WMS/WMTS)
    #[serde(default)]
    pub layers: Option<String>,

    /// Tile matrix set identifier (WMTS)
    #[serde(default)]
    pub tile_matrix_set: Option<String>,

    /// Protocol version override
    #[serde(default)]
    pub version: Option<String>,

    /// Output format requested from the service
    #[serde(default)]
    pub output_format: Option<OutputFormat>,

    /// CRS for the request bounds and subsetting
    #[serde(default)]
    pub crs: Crs,

    /// Extra query parameters merged into every tile request (override
    /// protocol defaults, last-write-wins)
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Extra HTTP headers sent with every tile request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Resolve the protocol, detecting it from the URL when not set.
    pub fn resolve_kind(&self) -> Result<ServiceKind> {
        match self.kind {
            Some(kind) => Ok(kind),
            None => detect_service_kind(&self.url),
        }
    }

    /// Build the protocol adapter this configuration describes.
    pub fn build_adapter(&self) -> Result<Box<dyn ServiceAdapter>> {
        let kind = self.resolve_kind()?;
        match kind {
            ServiceKind::Wcs => {
                let mut adapter = WcsAdapter::new(&self.url, self.coverage_id.clone());
                if let Some(version) = &self.version {
                    adapter = adapter.with_version(version);
                }
                if let Some(format) = self.output_format {
                    adapter = adapter.with_output_format(format);
                }
                Ok(Box::new(adapter))
            }
            ServiceKind::Wms => {
                let mut adapter = WmsAdapter::new(&self.url, self.layers.clone());
                if let Some(version) = &self.version {
                    adapter = adapter.with_version(version);
                }
                if let Some(format) = self.output_format {
                    adapter = adapter.with_output_format(format);
                }
                Ok(Box::new(adapter))
            }
            ServiceKind::Wmts => {
                let mut adapter = WmtsAdapter::new(
                    &self.url,
                    self.layers.clone(),
                    self.tile_matrix_set.clone(),
                );
                if let Some(format) = self.output_format {
                    adapter = adapter.with_output_format(format);
                }
                Ok(Box::new(adapter))
            }
        }
    }
}

/// Grid partition configuration. Explicit (rows, cols) and a target
/// resolution are mutually exclusive; with neither, the whole area is one
/// tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Requested tile width in pixels
    #[serde(default = "default_chunk_pixels")]
    pub chunk_width: u32,

    /// Requested tile height in pixels
    #[serde(default = "default_chunk_pixels")]
    pub chunk_height: u32,

    /// Explicit grid rows
    #[serde(default)]
    pub rows: Option<usize>,

    /// Explicit grid columns
    #[serde(default)]
    pub cols: Option<usize>,

    /// Target ground resolution [res_x, res_y] in CRS units per pixel
    #[serde(default)]
    pub resolution: Option<[f64; 2]>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            chunk_width: default_chunk_pixels(),
            chunk_height: default_chunk_pixels(),
            rows: None,
            cols: None,
            resolution: None,
        }
    }
}

impl GridConfig {
    /// Derive the planner spec from the configuration.
    pub fn spec(&self) -> Result<GridSpec> {
        match (self.rows, self.cols, self.resolution) {
            (Some(_), _, Some(_)) | (_, Some(_), Some(_)) => Err(Error::InvalidGrid(
                "rows/cols and resolution are mutually exclusive".to_string(),
            )),
            (Some(rows), Some(cols), None) => Ok(GridSpec::Explicit { rows, cols }),
            (Some(_), None, None) | (None, Some(_), None) => Err(Error::InvalidGrid(
                "rows and cols must be specified together".to_string(),
            )),
            (None, None, Some([res_x, res_y])) => Ok(GridSpec::Resolution { res_x, res_y }),
            (None, None, None) => Ok(GridSpec::Explicit { rows: 1, cols: 1 }),
        }
    }

    /// Requested (width, height) per tile.
    pub fn chunk_pixels(&self) -> (u32, u32) {
        (self.chunk_width, self.chunk_height)
    }
}

/// Fetching and caching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry attempts after the first failure
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Number of tile tasks evaluated concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Directory for the on-disk tile cache; no disk cache when omitted
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// In-memory tile cache budget in MB; 0 disables the memory layer
    #[serde(default = "default_memory_cache_mb")]
    pub memory_cache_mb: u64,

    /// Wall-clock bound in seconds for one whole materialization
    #[serde(default)]
    pub load_timeout_secs: Option<u64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            concurrency: default_concurrency(),
            cache_dir: None,
            memory_cache_mb: default_memory_cache_mb(),
            load_timeout_secs: None,
        }
    }
}

impl FetchConfig {
    /// Per-request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whole-load timeout as a duration, when configured.
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_secs.map(Duration::from_secs)
    }
}

impl LoadConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from the file extension (.yaml, .yml, .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: LoadConfig = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON, so it is also the fallback
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The configured area as a bounding box in the service CRS.
    pub fn bounding_box(&self) -> Result<BoundingBox> {
        let [min_x, min_y, max_x, max_y] = self.bbox.ok_or_else(|| {
            Error::InvalidBounds("no bbox configured; set `bbox` or pass one explicitly".into())
        })?;
        BoundingBox::new(min_x, min_y, max_x, max_y, self.service.crs)
    }

    /// Front-load every configuration error before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.service.url.trim().is_empty() {
            return Err(Error::UnknownService("service URL is empty".to_string()));
        }

        let kind = self.service.resolve_kind()?;
        match kind {
            ServiceKind::Wcs => {
                if self.service.coverage_id.is_none() {
                    return Err(Error::MissingCoverageId);
                }
            }
            ServiceKind::Wms => {
                if self.service.layers.is_none() {
                    return Err(Error::MissingLayer);
                }
            }
            ServiceKind::Wmts => {
                if self.service.layers.is_none() {
                    return Err(Error::MissingLayer);
                }
                if self.service.tile_matrix_set.is_none() {
                    return Err(Error::MissingTileMatrixSet);
                }
            }
        }

        if let Some(bbox) = self.bbox {
            BoundingBox::new(bbox[0], bbox[1], bbox[2], bbox[3], self.service.crs)?;
        }

        if self.grid.chunk_width == 0 || self.grid.chunk_height == 0 {
            return Err(Error::InvalidGrid(
                "chunk dimensions must be positive".to_string(),
            ));
        }
        let spec = self.grid.spec()?;
        match spec {
            GridSpec::Explicit { rows, cols } if rows == 0 || cols == 0 => {
                return Err(Error::InvalidGrid(
                    "grid rows and cols must be positive".to_string(),
                ));
            }
            GridSpec::Resolution { res_x, res_y } if res_x <= 0.0 || res_y <= 0.0 => {
                return Err(Error::InvalidGrid(
                    "resolution values must be positive".to_string(),
                ));
            }
            _ => {}
        }

        if self.fetch.concurrency == 0 {
            return Err(Error::InvalidGrid("concurrency must be positive".to_string()));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(Error::InvalidGrid("timeout must be positive".to_string()));
        }

        Ok(())
    }

    /// Per-request options derived from the configuration.
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            coverage_id: None,
            output_format: None,
            crs: Some(self.service.crs),
            params: self
                .service
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            headers: self
                .service
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: self.fetch.timeout(),
            retries: self.fetch.retries,
        }
    }
}

// Default value functions for serde
fn default_chunk_pixels() -> u32 {
    256
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retries() -> u32 {
    3
}
fn default_concurrency() -> usize {
    8
}
fn default_memory_cache_mb() -> u64 {
    64
}
