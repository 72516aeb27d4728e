//! Tile grid planning: divide a bounding box into fetchable tile geometries.
//!
//! Two planning modes exist and intentionally behave differently at the
//! edges:
//!
//! - **Explicit grid**: a fixed (rows, cols) partition. Every cell gets the
//!   same pixel size; the last row/column absorbs the floating-point
//!   remainder so the cells tile the box exactly. Ground resolution at the
//!   edge cells therefore varies slightly.
//! - **Resolution-driven**: a fixed ground resolution. Trailing cells are
//!   clipped to the box edge and their pixel size is reduced
//!   proportionally, keeping units-per-pixel constant across the grid.

use crate::error::{Error, Result};
use crate::geo::{BoundingBox, Crs};

/// Spatial footprint and raster size of one tile to fetch.
///
/// Produced by [`plan_tiles`]; read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGeometry {
    /// Geographic extent the tile covers.
    pub bbox: BoundingBox,

    /// Tile width in output pixels.
    pub width: u32,

    /// Tile height in output pixels.
    pub height: u32,

    /// CRS in which the bounds are expressed. Always equals `bbox.crs`.
    pub crs: Crs,
}

impl TileGeometry {
    /// Create a tile geometry. Pixel dimensions must be positive.
    pub fn new(bbox: BoundingBox, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidGrid(format!(
                "tile pixel dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            crs: bbox.crs,
            bbox,
            width,
            height,
        })
    }
}

/// How to partition a bounding box into tiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GridSpec {
    /// Fixed (rows, cols) partition with uniform pixel size per cell.
    Explicit {
        /// Number of row strips (south to north).
        rows: usize,
        /// Number of columns (west to east).
        cols: usize,
    },

    /// Fixed ground resolution in CRS units per pixel.
    Resolution {
        /// Units per pixel along x.
        res_x: f64,
        /// Units per pixel along y.
        res_y: f64,
    },
}

/// Plan the tile layout for a bounding box.
///
/// `chunk_pixels` is the (width, height) requested per tile; in resolution
/// mode trailing cells may end up smaller. Tiles are generated in row-major
/// order from the south-west corner; the assembler re-orders them into its
/// canonical north-first layout, so generation order carries no meaning
/// beyond determinism.
///
/// Fails on non-positive grid counts, resolutions, or chunk sizes before
/// any network activity.
pub fn plan_tiles(
    bbox: &BoundingBox,
    chunk_pixels: (u32, u32),
    spec: &GridSpec,
) -> Result<Vec<TileGeometry>> {
    let (chunk_width, chunk_height) = chunk_pixels;
    if chunk_width == 0 || chunk_height == 0 {
        return Err(Error::InvalidGrid(format!(
            "chunk size must be positive, got {}x{}",
            chunk_width, chunk_height
        )));
    }

    match *spec {
        GridSpec::Explicit { rows, cols } => plan_explicit(bbox, chunk_pixels, rows, cols),
        GridSpec::Resolution { res_x, res_y } => {
            plan_resolution(bbox, chunk_pixels, res_x, res_y)
        }
    }
}

fn plan_explicit(
    bbox: &BoundingBox,
    (chunk_width, chunk_height): (u32, u32),
    rows: usize,
    cols: usize,
) -> Result<Vec<TileGeometry>> {
    if rows == 0 || cols == 0 {
        return Err(Error::InvalidGrid(format!(
            "grid shape dimensions must be positive, got {}x{}",
            rows, cols
        )));
    }

    let step_x = bbox.width() / cols as f64;
    let step_y = bbox.height() / rows as f64;

    let mut tiles = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        let min_y = bbox.min_y + row as f64 * step_y;
        // Last row takes the exact box edge so the union stays gap-free
        let max_y = if row < rows - 1 {
            bbox.min_y + (row + 1) as f64 * step_y
        } else {
            bbox.max_y
        };

        for col in 0..cols {
            let min_x = bbox.min_x + col as f64 * step_x;
            let max_x = if col < cols - 1 {
                bbox.min_x + (col + 1) as f64 * step_x
            } else {
                bbox.max_x
            };

            tiles.push(TileGeometry::new(
                BoundingBox::new(min_x, min_y, max_x, max_y, bbox.crs)?,
                chunk_width,
                chunk_height,
            )?);
        }
    }

    Ok(tiles)
}

fn plan_resolution(
    bbox: &BoundingBox,
    (chunk_width, chunk_height): (u32, u32),
    res_x: f64,
    res_y: f64,
) -> Result<Vec<TileGeometry>> {
    if res_x <= 0.0 || res_y <= 0.0 || !res_x.is_finite() || !res_y.is_finite() {
        return Err(Error::InvalidGrid(format!(
            "resolution values must be positive, got ({}, {})",
            res_x, res_y
        )));
    }

    let tile_width_units = chunk_width as f64 * res_x;
    let tile_height_units = chunk_height as f64 * res_y;

    // Guard against a degenerate trailing sliver caused by float drift
    let epsilon = res_x.min(res_y) / 10.0;

    let mut tiles = Vec::new();
    let mut current_min_y = bbox.min_y;
    while current_min_y < bbox.max_y - epsilon {
        let current_max_y = (current_min_y + tile_height_units).min(bbox.max_y);
        let span_y = current_max_y - current_min_y;
        let pixel_height = ((span_y / res_y).ceil() as u32).max(1);

        let mut current_min_x = bbox.min_x;
        while current_min_x < bbox.max_x - epsilon {
            let current_max_x = (current_min_x + tile_width_units).min(bbox.max_x);
            let span_x = current_max_x - current_min_x;
            let pixel_width = ((span_x / res_x).ceil() as u32).max(1);

            tiles.push(TileGeometry::new(
                BoundingBox::new(current_min_x, current_min_y, current_max_x, current_max_y, bbox.crs)?,
                pixel_width,
                pixel_height,
            )?);

            current_min_x = current_max_x;
        }
        current_min_y = current_max_y;
    }

    Ok(tiles)
}

/// Derive the (rows, cols) partition of a planned tile list.
///
/// Columns are the tiles sharing the southernmost strip; rows follow from
/// the total count. Fails when the list is empty or not rectangular.
pub fn grid_shape(tiles: &[TileGeometry]) -> Result<(usize, usize)> {
    if tiles.is_empty() {
        return Err(Error::InvalidGrid("tile list is empty".to_string()));
    }

    let first_min_y = tiles[0].bbox.min_y;
    let cols = tiles
        .iter()
        .filter(|t| (t.bbox.min_y - first_min_y).abs() < f64::EPSILON * 8.0)
        .count();

    if cols == 0 || tiles.len() % cols != 0 {
        return Err(Error::InvalidGrid(format!(
            "{} tiles do not form a rectangular grid with {} columns",
            tiles.len(),
            cols
        )));
    }

    Ok((tiles.len() / cols, cols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bbox(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> BoundingBox {
        BoundingBox::new(min_x, min_y, max_x, max_y, Crs::Epsg4326).unwrap()
    }

    #[test]
    fn test_explicit_grid_counts_and_coverage() {
        let area = bbox(0.0, 0.0, 3.0, 2.0);
        let tiles = plan_tiles(
            &area,
            (256, 256),
            &GridSpec::Explicit { rows: 2, cols: 3 },
        )
        .unwrap();

        assert_eq!(tiles.len(), 6);
        assert!(tiles.iter().all(|t| t.width == 256 && t.height == 256));

        // Union of tiles equals the input box exactly
        let union = tiles
            .iter()
            .skip(1)
            .fold(tiles[0].bbox, |acc, t| acc.union(&t.bbox).unwrap());
        assert_eq!(union, area);

        // Adjacent cells share edges with no gaps
        assert_relative_eq!(tiles[0].bbox.max_x, tiles[1].bbox.min_x);
        assert_relative_eq!(tiles[0].bbox.max_y, tiles[3].bbox.min_y);
    }

    #[test]
    fn test_explicit_grid_last_cell_absorbs_remainder() {
        // 1.0 / 3 is not exact; the last column must still end at max_x
        let area = bbox(0.0, 0.0, 1.0, 1.0);
        let tiles = plan_tiles(
            &area,
            (64, 64),
            &GridSpec::Explicit { rows: 3, cols: 3 },
        )
        .unwrap();

        assert_eq!(tiles.len(), 9);
        let last = &tiles[8];
        assert_eq!(last.bbox.max_x, 1.0);
        assert_eq!(last.bbox.max_y, 1.0);
    }

    #[test]
    fn test_explicit_grid_rejects_zero() {
        let area = bbox(0.0, 0.0, 1.0, 1.0);
        assert!(plan_tiles(&area, (64, 64), &GridSpec::Explicit { rows: 0, cols: 2 }).is_err());
        assert!(plan_tiles(&area, (64, 64), &GridSpec::Explicit { rows: 2, cols: 0 }).is_err());
        assert!(plan_tiles(&area, (0, 64), &GridSpec::Explicit { rows: 2, cols: 2 }).is_err());
    }

    #[test]
    fn test_resolution_grid_even_split() {
        // 1000x1000 units, 500px chunks at 1 unit/px -> exactly 4 tiles of 500x500
        let area = bbox(0.0, 0.0, 1000.0, 1000.0);
        let tiles = plan_tiles(
            &area,
            (500, 500),
            &GridSpec::Resolution {
                res_x: 1.0,
                res_y: 1.0,
            },
        )
        .unwrap();

        assert_eq!(tiles.len(), 4);
        for tile in &tiles {
            assert_eq!(tile.width, 500);
            assert_eq!(tile.height, 500);
        }
        assert_eq!(grid_shape(&tiles).unwrap(), (2, 2));
    }

    #[test]
    fn test_resolution_grid_clips_trailing_cell() {
        // 1200 units wide at 500px/500units per tile -> 2 full columns + 200-unit remainder
        let area = bbox(0.0, 0.0, 1200.0, 500.0);
        let tiles = plan_tiles(
            &area,
            (500, 500),
            &GridSpec::Resolution {
                res_x: 1.0,
                res_y: 1.0,
            },
        )
        .unwrap();

        assert_eq!(tiles.len(), 3);
        assert_eq!(tiles[0].width, 500);
        assert_eq!(tiles[1].width, 500);
        assert_eq!(tiles[2].width, 200);
        assert_eq!(tiles[2].bbox.max_x, 1200.0);
        // Height unaffected by the x remainder
        assert!(tiles.iter().all(|t| t.height == 500));
    }

    #[test]
    fn test_resolution_grid_epsilon_suppresses_sliver() {
        // Width of 1000 + tiny drift must not produce a 1px trailing column
        let area = bbox(0.0, 0.0, 1000.0 + 1e-9, 1000.0);
        let tiles = plan_tiles(
            &area,
            (500, 500),
            &GridSpec::Resolution {
                res_x: 1.0,
                res_y: 1.0,
            },
        )
        .unwrap();

        assert_eq!(tiles.len(), 4);
    }

    #[test]
    fn test_resolution_grid_rejects_nonpositive() {
        let area = bbox(0.0, 0.0, 1.0, 1.0);
        for (rx, ry) in [(0.0, 1.0), (1.0, 0.0), (-1.0, 1.0), (f64::NAN, 1.0)] {
            assert!(plan_tiles(
                &area,
                (64, 64),
                &GridSpec::Resolution { res_x: rx, res_y: ry }
            )
            .is_err());
        }
    }

    #[test]
    fn test_grid_shape_detection() {
        let area = bbox(0.0, 0.0, 4.0, 2.0);
        let tiles = plan_tiles(
            &area,
            (32, 32),
            &GridSpec::Explicit { rows: 2, cols: 4 },
        )
        .unwrap();
        assert_eq!(grid_shape(&tiles).unwrap(), (2, 4));
    }
}
