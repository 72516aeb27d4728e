//! Assembly of fetched tiles into one labeled 2-D array.
//!
//! Assembly is two-phase. `Assembler::assemble` eagerly builds the task
//! graph: it validates the grid, orders tiles into their canonical raster
//! layout, and computes coordinate vectors — without touching the network.
//! The returned [`TileArray`] is lazy; nothing is fetched until
//! [`TileArray::compute`] fans the independent tile tasks out across a
//! bounded worker pool.
//!
//! ## Canonical ordering
//!
//! Tiles are sorted by descending north edge, then ascending west edge, and
//! sliced into `rows` strips of `cols`: row 0 is the northernmost strip read
//! west to east, the conventional north-at-top raster layout. The order in
//! which tiles were planned or fetched never affects placement.
//!
//! ## Failure model
//!
//! A failed fetch or an undecodable tile fills that cell with NaN and the
//! load succeeds. Structural problems (tile count mismatch, missing
//! decoder, decoded shape not an integer multiple of the requested shape)
//! fail the whole load.

use crate::decode::{downsample_mean, DecoderRegistry};
use crate::error::{Error, Result};
use crate::fetch::TileFetcher;
use crate::geo::{BoundingBox, Crs};
use crate::metrics::Metrics;
use crate::service::{OutputFormat, ServiceKind, TileRequest};
use futures::stream::{self, StreamExt};
use ndarray::{s, Array1, Array2};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of tile tasks evaluated concurrently.
const DEFAULT_CONCURRENCY: usize = 8;

/// Metadata attached to an assembled array.
#[derive(Debug, Clone)]
pub struct ArrayAttrs {
    /// CRS of the array's coordinate axes.
    pub crs: Crs,

    /// Endpoint the tiles came from.
    pub service_url: String,

    /// Protocol the tiles were requested with.
    pub service_type: ServiceKind,

    /// Output format, when uniform across the load.
    pub output_format: Option<OutputFormat>,

    /// Coverage/layer identifier, when available.
    pub coverage_id: Option<String>,
}

/// One deferred unit of work: fetch, decode, and downsample a single tile,
/// then place it at a fixed pixel offset.
#[derive(Debug, Clone)]
struct TileTask {
    /// Pixel row offset of the cell's top edge in the assembled array.
    row_offset: usize,

    /// Pixel column offset of the cell's left edge.
    col_offset: usize,

    request: TileRequest,
}

/// Builds lazy tile arrays from ordered tile requests.
pub struct Assembler {
    fetcher: Arc<dyn TileFetcher>,
    registry: Arc<DecoderRegistry>,
    concurrency: usize,
    metrics: Option<Arc<Metrics>>,
    load_timeout: Option<Duration>,
}

impl Assembler {
    /// Create an assembler over a fetcher and decoder registry.
    pub fn new(fetcher: Arc<dyn TileFetcher>, registry: Arc<DecoderRegistry>) -> Self {
        Self {
            fetcher,
            registry,
            concurrency: DEFAULT_CONCURRENCY,
            metrics: None,
            load_timeout: None,
        }
    }

    /// Bound the number of concurrently evaluated tile tasks.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Record per-tile activity on the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wall-clock bound for a whole materialization.
    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Build the lazy array for a set of tile requests.
    ///
    /// Validates the grid and pre-checks decoder availability so every
    /// structural error surfaces before any I/O is scheduled.
    pub fn assemble(
        &self,
        mut requests: Vec<TileRequest>,
        grid_shape: (usize, usize),
        attrs: ArrayAttrs,
    ) -> Result<TileArray> {
        let (rows, cols) = grid_shape;
        if rows == 0 || cols == 0 || requests.len() != rows * cols {
            return Err(Error::GridMismatch {
                expected: rows * cols,
                actual: requests.len(),
                rows,
                cols,
            });
        }

        for request in &requests {
            if !self.registry.contains(request.output_format) {
                return Err(Error::NoDecoder(request.output_format.as_mime().to_string()));
            }
        }

        // Canonical raster order: north strip first, west to east within it
        requests.sort_by(|a, b| {
            b.bbox
                .max_y
                .total_cmp(&a.bbox.max_y)
                .then(a.bbox.min_x.total_cmp(&b.bbox.min_x))
        });

        // Pixel geometry must be consistent: one height per row strip, one
        // width per column. The planner guarantees this; hand-built request
        // lists might not.
        let row_heights: Vec<usize> = (0..rows)
            .map(|r| requests[r * cols].height as usize)
            .collect();
        let col_widths: Vec<usize> = (0..cols).map(|c| requests[c].width as usize).collect();

        for (i, request) in requests.iter().enumerate() {
            let (r, c) = (i / cols, i % cols);
            if request.height as usize != row_heights[r] || request.width as usize != col_widths[c]
            {
                return Err(Error::ShapeMismatch(format!(
                    "tile at grid ({}, {}) is {}x{} pixels, expected {}x{} from its row/column",
                    r, c, request.height, request.width, row_heights[r], col_widths[c]
                )));
            }
        }

        let total_height: usize = row_heights.iter().sum();
        let total_width: usize = col_widths.iter().sum();

        // Overall extent: union of every tile's bbox
        let bbox = requests
            .iter()
            .skip(1)
            .try_fold(requests[0].bbox, |acc, r| acc.union(&r.bbox))?;

        // Pixel offsets per cell
        let mut row_offsets = Vec::with_capacity(rows);
        let mut acc = 0;
        for height in &row_heights {
            row_offsets.push(acc);
            acc += height;
        }
        let mut col_offsets = Vec::with_capacity(cols);
        let mut acc = 0;
        for width in &col_widths {
            col_offsets.push(acc);
            acc += width;
        }

        let tasks = requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| TileTask {
                row_offset: row_offsets[i / cols],
                col_offset: col_offsets[i % cols],
                request,
            })
            .collect();

        // Axis coordinates over the full extent: x west->east, y north->south
        // to match row 0 being the northernmost strip
        let x = Array1::linspace(bbox.min_x, bbox.max_x, total_width);
        let y = Array1::linspace(bbox.max_y, bbox.min_y, total_height);

        Ok(TileArray {
            tasks,
            rows,
            cols,
            shape: (total_height, total_width),
            bbox,
            x,
            y,
            attrs,
            fetcher: self.fetcher.clone(),
            registry: self.registry.clone(),
            concurrency: self.concurrency,
            metrics: self.metrics.clone(),
            load_timeout: self.load_timeout,
        })
    }
}

/// A lazily evaluated tile array: the task graph plus coordinates and
/// metadata. No network or disk I/O happens until [`TileArray::compute`].
pub struct TileArray {
    tasks: Vec<TileTask>,
    rows: usize,
    cols: usize,
    shape: (usize, usize),
    bbox: BoundingBox,
    x: Array1<f64>,
    y: Array1<f64>,
    attrs: ArrayAttrs,
    fetcher: Arc<dyn TileFetcher>,
    registry: Arc<DecoderRegistry>,
    concurrency: usize,
    metrics: Option<Arc<Metrics>>,
    load_timeout: Option<Duration>,
}

impl TileArray {
    /// Realized array shape (height, width) in pixels.
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Grid partition (rows, cols) behind the array.
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Overall extent covered by the array.
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// x axis coordinates, west to east.
    pub fn x(&self) -> &Array1<f64> {
        &self.x
    }

    /// y axis coordinates, north to south.
    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    /// Attached metadata.
    pub fn attrs(&self) -> &ArrayAttrs {
        &self.attrs
    }

    /// Number of tile tasks in the graph.
    pub fn num_tiles(&self) -> usize {
        self.tasks.len()
    }

    /// Metrics shared with the fetcher, when configured.
    pub fn metrics(&self) -> Option<Arc<Metrics>> {
        self.metrics.clone()
    }

    /// Materialize the array.
    ///
    /// Fans the tile tasks out with bounded concurrency. Evaluation order
    /// is unspecified; each cell's placement is fixed by its grid position.
    pub async fn compute(&self) -> Result<LoadedArray> {
        tracing::info!(
            "Computing {}x{} array from {} tiles ({} concurrent)",
            self.shape.0,
            self.shape.1,
            self.tasks.len(),
            self.concurrency
        );

        match self.load_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.compute_inner())
                .await
                .map_err(|_| Error::Timeout(timeout.as_secs()))?,
            None => self.compute_inner().await,
        }
    }

    async fn compute_inner(&self) -> Result<LoadedArray> {
        let results: Vec<Result<(usize, usize, Array2<f32>)>> = stream::iter(self.tasks.iter())
            .map(|task| async move {
                let cell = self.run_task(task).await?;
                Ok((task.row_offset, task.col_offset, cell))
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut data = Array2::from_elem(self.shape, f32::NAN);
        for result in results {
            let (row_offset, col_offset, cell) = result?;
            let (cell_h, cell_w) = cell.dim();
            data.slice_mut(s![
                row_offset..row_offset + cell_h,
                col_offset..col_offset + cell_w
            ])
            .assign(&cell);
        }

        Ok(LoadedArray {
            data,
            x: self.x.clone(),
            y: self.y.clone(),
            attrs: self.attrs.clone(),
        })
    }

    /// Evaluate one cell: fetch, decode, downsample.
    ///
    /// Returns the NaN-filled cell for soft failures; only structural
    /// errors propagate.
    async fn run_task(&self, task: &TileTask) -> Result<Array2<f32>> {
        let target_h = task.request.height as usize;
        let target_w = task.request.width as usize;

        let response = self.fetcher.fetch(&task.request).await;
        if !response.success {
            tracing::warn!(
                "Tile fetch failed for {}: {}",
                task.request.bbox,
                response
                    .error_message
                    .as_deref()
                    .unwrap_or("unknown error")
            );
            return Ok(Array2::from_elem((target_h, target_w), f32::NAN));
        }

        // Decoding is CPU-bound; keep it off the async workers
        let registry = self.registry.clone();
        let request = task.request.clone();
        let format = task.request.output_format;
        let decode_start = Instant::now();
        let decoded = tokio::task::spawn_blocking(move || {
            let decoder = registry.get(format)?;
            let decoded = decoder(&response, &request)?;
            downsample_mean(decoded, target_h, target_w)
        })
        .await
        .map_err(|e| Error::Decode(format!("decode task panicked: {}", e)))?;

        if let Some(ref m) = self.metrics {
            m.add_decode_time(decode_start.elapsed());
        }

        match decoded {
            Ok(cell) => Ok(cell),
            // Shape and registry problems are deterministic and structural
            err @ Err(Error::ShapeMismatch(_)) | err @ Err(Error::NoDecoder(_)) => err,
            Err(e) => {
                tracing::warn!("Tile decode failed for {}: {}", task.request.bbox, e);
                if let Some(ref m) = self.metrics {
                    m.add_tile_failure();
                }
                Ok(Array2::from_elem((target_h, target_w), f32::NAN))
            }
        }
    }
}

/// A materialized array with its coordinate vectors and metadata.
#[derive(Debug, Clone)]
pub struct LoadedArray {
    /// Pixel values, row 0 at the north edge.
    pub data: Array2<f32>,

    /// x axis coordinates, west to east.
    pub x: Array1<f64>,

    /// y axis coordinates, north to south.
    pub y: Array1<f64>,

    /// Attached metadata.
    pub attrs: ArrayAttrs,
}

impl LoadedArray {
    /// Array shape (height, width).
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Number of NaN cells (failed tile regions).
    pub fn nan_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_nan()).count()
    }

    /// Minimum finite value, if any.
    pub fn min(&self) -> Option<f32> {
        self.data
            .iter()
            .filter(|v| v.is_finite())
            .copied()
            .reduce(f32::min)
    }

    /// Maximum finite value, if any.
    pub fn max(&self) -> Option<f32> {
        self.data
            .iter()
            .filter(|v| v.is_finite())
            .copied()
            .reduce(f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::TileResponse;
    use async_trait::async_trait;

    /// Fetcher that never succeeds; assembly itself must not call it.
    struct PanicFetcher;

    #[async_trait]
    impl TileFetcher for PanicFetcher {
        async fn fetch(&self, _request: &TileRequest) -> TileResponse {
            panic!("fetch called during assembly");
        }
    }

    fn attrs() -> ArrayAttrs {
        ArrayAttrs {
            crs: Crs::Epsg4326,
            service_url: "http://example.com/wcs".to_string(),
            service_type: ServiceKind::Wcs,
            output_format: Some(OutputFormat::Binary),
            coverage_id: Some("test".to_string()),
        }
    }

    fn unit_request(min_x: f64, min_y: f64, width: u32, height: u32) -> TileRequest {
        TileRequest {
            url: "http://example.com/wcs".to_string(),
            params: Vec::new(),
            headers: Vec::new(),
            timeout: Duration::from_secs(30),
            retries: 0,
            output_format: OutputFormat::Binary,
            crs: Crs::Epsg4326,
            bbox: BoundingBox::new(min_x, min_y, min_x + 1.0, min_y + 1.0, Crs::Epsg4326)
                .unwrap(),
            width,
            height,
        }
    }

    fn assembler() -> Assembler {
        Assembler::new(Arc::new(PanicFetcher), Arc::new(DecoderRegistry::default()))
    }

    #[test]
    fn test_grid_mismatch_rejected() {
        let requests = vec![unit_request(0.0, 0.0, 4, 4)];
        let result = assembler().assemble(requests, (2, 2), attrs());
        assert!(matches!(result, Err(Error::GridMismatch { .. })));
    }

    #[test]
    fn test_missing_decoder_rejected_before_io() {
        let mut request = unit_request(0.0, 0.0, 4, 4);
        request.output_format = OutputFormat::NetCdf;
        let result = assembler().assemble(vec![request], (1, 1), attrs());
        assert!(matches!(result, Err(Error::NoDecoder(_))));
    }

    #[test]
    fn test_canonical_ordering_north_first() {
        // Four unit squares covering (0,0,2,2), supplied in scrambled order
        let requests = vec![
            unit_request(1.0, 0.0, 4, 4), // SE
            unit_request(0.0, 1.0, 4, 4), // NW
            unit_request(1.0, 1.0, 4, 4), // NE
            unit_request(0.0, 0.0, 4, 4), // SW
        ];

        let array = assembler().assemble(requests, (2, 2), attrs()).unwrap();

        // Row 0 holds the tiles with the greatest min_y (the north strip),
        // west before east within the row
        assert_eq!(array.tasks[0].request.bbox.min_y, 1.0);
        assert_eq!(array.tasks[0].request.bbox.min_x, 0.0);
        assert_eq!(array.tasks[1].request.bbox.min_y, 1.0);
        assert_eq!(array.tasks[1].request.bbox.min_x, 1.0);
        assert_eq!(array.tasks[2].request.bbox.min_y, 0.0);
        assert_eq!(array.tasks[3].request.bbox.min_y, 0.0);

        // Offsets follow the grid positions
        assert_eq!(
            (array.tasks[0].row_offset, array.tasks[0].col_offset),
            (0, 0)
        );
        assert_eq!(
            (array.tasks[1].row_offset, array.tasks[1].col_offset),
            (0, 4)
        );
        assert_eq!(
            (array.tasks[2].row_offset, array.tasks[2].col_offset),
            (4, 0)
        );
    }

    #[test]
    fn test_shape_and_coordinates() {
        let requests = vec![
            unit_request(0.0, 0.0, 8, 8),
            unit_request(1.0, 0.0, 8, 8),
            unit_request(0.0, 1.0, 8, 8),
            unit_request(1.0, 1.0, 8, 8),
        ];
        let array = assembler().assemble(requests, (2, 2), attrs()).unwrap();

        assert_eq!(array.shape(), (16, 16));
        assert_eq!(array.grid_shape(), (2, 2));
        assert_eq!(array.num_tiles(), 4);

        // x ascends west->east, y descends north->south
        assert_eq!(array.x()[0], 0.0);
        assert!((array.x()[15] - 2.0).abs() < 1e-9);
        assert_eq!(array.y()[0], 2.0);
        assert!(array.y()[15].abs() < 1e-9);

        let bbox = array.bbox();
        assert_eq!((bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y), (0.0, 0.0, 2.0, 2.0));
    }

    #[test]
    fn test_inconsistent_row_heights_rejected() {
        let mut tall = unit_request(0.0, 0.0, 8, 8);
        tall.height = 16;
        let requests = vec![unit_request(1.0, 0.0, 8, 8), tall];
        let result = assembler().assemble(requests, (1, 2), attrs());
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_assembly_is_lazy() {
        // PanicFetcher proves no I/O happens before compute()
        let requests = vec![unit_request(0.0, 0.0, 4, 4)];
        let array = assembler().assemble(requests, (1, 1), attrs()).unwrap();
        assert_eq!(array.shape(), (4, 4));
    }
}
