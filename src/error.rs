//! Error types for tile loading.
//!
//! Only configuration and structural problems surface as errors from the
//! public API. Per-tile fetch or decode failures are soft: they are recorded
//! on the [`crate::fetch::TileResponse`] or absorbed as NaN cells during
//! assembly and never abort a load.

use thiserror::Error;

/// Errors that can occur while planning, configuring, or assembling a load.
#[derive(Debug, Error)]
pub enum Error {
    /// Bounding box coordinates violate the min < max invariant.
    #[error("Invalid bounding box: {0}")]
    InvalidBounds(String),

    /// Grid shape or resolution values are unusable.
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// A coverage identifier was required but not configured or supplied.
    #[error("Coverage identifier is required but was not provided")]
    MissingCoverageId,

    /// A layer name was required but not configured or supplied.
    #[error("Layer name is required but was not provided")]
    MissingLayer,

    /// A WMTS tile matrix set was required but not configured.
    #[error("Tile matrix set is required for WMTS but was not provided")]
    MissingTileMatrixSet,

    /// CRS string could not be mapped to a known identifier.
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),

    /// Output format string could not be mapped to a known format.
    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    /// Service type could not be determined from the URL or configuration.
    #[error("Unable to determine service type for URL: {0}")]
    UnknownService(String),

    /// Number of tile requests does not match the declared grid shape.
    #[error("Grid mismatch: expected {expected} tiles for a {rows}x{cols} grid, got {actual}")]
    GridMismatch {
        /// Tiles implied by the grid shape.
        expected: usize,
        /// Tiles actually supplied.
        actual: usize,
        /// Declared row count.
        rows: usize,
        /// Declared column count.
        cols: usize,
    },

    /// Decoded tile shape cannot be reconciled with the requested shape.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No decoder registered for the effective output format.
    #[error("No decoder registered for format: {0}")]
    NoDecoder(String),

    /// Tile bytes could not be decoded. Soft at the load level: the
    /// assembler converts this into a NaN-filled cell.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Coordinate transform between two CRS failed or is unavailable.
    #[error("Projection error: {0}")]
    Projection(String),

    /// Capabilities or coverage description XML could not be parsed.
    #[error("Capabilities error: {0}")]
    Capabilities(String),

    /// I/O error (cache directory creation, config file reads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The whole-load timeout elapsed before materialization finished.
    #[error("Load timed out after {0} seconds")]
    Timeout(u64),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
