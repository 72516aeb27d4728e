//! Cross-module scenarios: plan, adapt, assemble, and compute against a
//! stubbed fetcher. No network is involved.

use crate::assemble::{ArrayAttrs, Assembler};
use crate::decode::DecoderRegistry;
use crate::error::Error;
use crate::fetch::{TileFetcher, TileResponse};
use crate::geo::{BoundingBox, Crs};
use crate::grid::{grid_shape, plan_tiles, GridSpec};
use crate::service::{
    OutputFormat, RequestOptions, ServiceAdapter, ServiceKind, TileRequest, WcsAdapter,
};
use async_trait::async_trait;
use bytes::Bytes;
use ndarray::Array2;
use std::sync::Arc;

/// Serves each tile as a raw f32 grid filled with a value derived from the
/// tile's west/south corner, so assembled quadrants are distinguishable.
/// Tiles whose bbox matches `fail` come back as HTTP 500.
struct StubFetcher {
    fail: Option<BoundingBox>,
    /// Decoded pixels per requested pixel along each axis (1 = exact size).
    oversample: u32,
}

impl StubFetcher {
    fn new() -> Self {
        Self {
            fail: None,
            oversample: 1,
        }
    }

    fn failing_on(bbox: BoundingBox) -> Self {
        Self {
            fail: Some(bbox),
            oversample: 1,
        }
    }

    fn tile_value(request: &TileRequest) -> f32 {
        (request.bbox.min_x + 10.0 * request.bbox.min_y) as f32
    }
}

#[async_trait]
impl TileFetcher for StubFetcher {
    async fn fetch(&self, request: &TileRequest) -> TileResponse {
        if self.fail.as_ref() == Some(&request.bbox) {
            return TileResponse::failure(500, "HTTP 500: simulated server error");
        }

        let width = request.width * self.oversample;
        let height = request.height * self.oversample;
        let value = Self::tile_value(request);
        let bytes: Vec<u8> = std::iter::repeat(value.to_le_bytes())
            .take((width * height) as usize)
            .flatten()
            .collect();

        TileResponse::success(Bytes::from(bytes), "application/octet-stream".into(), 200)
    }
}

fn wcs_requests(
    bbox: BoundingBox,
    chunk: (u32, u32),
    spec: &GridSpec,
) -> (Vec<TileRequest>, (usize, usize)) {
    let adapter =
        WcsAdapter::new("http://example.com/wcs", Some("test".into())).with_output_format(OutputFormat::Binary);
    let tiles = plan_tiles(&bbox, chunk, spec).unwrap();
    let shape = grid_shape(&tiles).unwrap();
    let requests = tiles
        .iter()
        .map(|t| adapter.build_tile_request(t, &RequestOptions::default()).unwrap())
        .collect();
    (requests, shape)
}

fn attrs(crs: Crs) -> ArrayAttrs {
    ArrayAttrs {
        crs,
        service_url: "http://example.com/wcs".to_string(),
        service_type: ServiceKind::Wcs,
        output_format: Some(OutputFormat::Binary),
        coverage_id: Some("test".to_string()),
    }
}

#[tokio::test]
async fn test_end_to_end_single_tile() {
    let bbox = BoundingBox::new(-1.0, 50.0, -0.5, 50.5, Crs::Epsg4326).unwrap();
    let (requests, shape) = wcs_requests(bbox, (8, 8), &GridSpec::Explicit { rows: 1, cols: 1 });

    let mut custom = DecoderRegistry::empty();
    custom.register(OutputFormat::Binary, |_, request| {
        Ok(Array2::from_elem(
            (request.height as usize, request.width as usize),
            1.0,
        ))
    });

    let array = Assembler::new(Arc::new(StubFetcher::new()), Arc::new(custom))
        .assemble(requests, shape, attrs(Crs::Epsg4326))
        .unwrap();

    let loaded = array.compute().await.unwrap();

    assert_eq!(loaded.shape(), (8, 8));
    assert!(loaded.data.iter().all(|&v| v == 1.0));

    // y spans [50.0, 50.5] north-first, x spans [-1.0, -0.5] west-first
    assert_eq!(loaded.y[0], 50.5);
    assert!((loaded.y[7] - 50.0).abs() < 1e-9);
    assert_eq!(loaded.x[0], -1.0);
    assert!((loaded.x[7] + 0.5).abs() < 1e-9);

    assert_eq!(loaded.attrs.coverage_id.as_deref(), Some("test"));
    assert_eq!(loaded.attrs.service_type, ServiceKind::Wcs);
}

#[tokio::test]
async fn test_quadrants_land_in_raster_order() {
    let bbox = BoundingBox::new(0.0, 0.0, 2.0, 2.0, Crs::Epsg4326).unwrap();
    let (requests, shape) = wcs_requests(bbox, (4, 4), &GridSpec::Explicit { rows: 2, cols: 2 });

    let array = Assembler::new(
        Arc::new(StubFetcher::new()),
        Arc::new(DecoderRegistry::default()),
    )
    .assemble(requests, shape, attrs(Crs::Epsg4326))
    .unwrap();

    let loaded = array.compute().await.unwrap();
    assert_eq!(loaded.shape(), (8, 8));

    // Stub value is min_x + 10*min_y. North-west quadrant (rows 0-3,
    // cols 0-3) is the tile at (0, 1): value 10.
    assert_eq!(loaded.data[[0, 0]], 10.0);
    // North-east: tile (1, 1) -> 11
    assert_eq!(loaded.data[[0, 7]], 11.0);
    // South-west: tile (0, 0) -> 0
    assert_eq!(loaded.data[[7, 0]], 0.0);
    // South-east: tile (1, 0) -> 1
    assert_eq!(loaded.data[[7, 7]], 1.0);
}

#[tokio::test]
async fn test_partial_failure_fills_quadrant_with_nan() {
    let bbox = BoundingBox::new(0.0, 0.0, 2.0, 2.0, Crs::Epsg4326).unwrap();
    let (requests, shape) = wcs_requests(bbox, (4, 4), &GridSpec::Explicit { rows: 2, cols: 2 });

    // Fail the north-west tile (west column of the north strip)
    let failing = BoundingBox::new(0.0, 1.0, 1.0, 2.0, Crs::Epsg4326).unwrap();

    let array = Assembler::new(
        Arc::new(StubFetcher::failing_on(failing)),
        Arc::new(DecoderRegistry::default()),
    )
    .assemble(requests, shape, attrs(Crs::Epsg4326))
    .unwrap();

    // The load itself succeeds
    let loaded = array.compute().await.unwrap();

    // North-west quadrant all NaN
    for row in 0..4 {
        for col in 0..4 {
            assert!(
                loaded.data[[row, col]].is_nan(),
                "expected NaN at ({}, {})",
                row,
                col
            );
        }
    }
    // The other three quadrants carry their tile values
    assert_eq!(loaded.data[[0, 4]], 11.0);
    assert_eq!(loaded.data[[4, 0]], 0.0);
    assert_eq!(loaded.data[[4, 4]], 1.0);
    assert_eq!(loaded.nan_count(), 16);
}

#[tokio::test]
async fn test_oversampled_tiles_are_downsampled() {
    let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0, Crs::Epsg4326).unwrap();
    let (requests, shape) = wcs_requests(bbox, (8, 8), &GridSpec::Explicit { rows: 1, cols: 1 });

    // Server returns 16x16 for an 8x8 request; block-mean keeps the value
    let fetcher = StubFetcher {
        fail: None,
        oversample: 2,
    };

    let array = Assembler::new(Arc::new(fetcher), Arc::new(DecoderRegistry::default()))
        .assemble(requests, shape, attrs(Crs::Epsg4326))
        .unwrap();

    let loaded = array.compute().await.unwrap();
    assert_eq!(loaded.shape(), (8, 8));
    assert!(loaded.data.iter().all(|&v| v == 0.0));
    assert_eq!(loaded.nan_count(), 0);
}

#[tokio::test]
async fn test_non_multiple_decoded_shape_is_fatal() {
    let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0, Crs::Epsg4326).unwrap();
    let (requests, shape) = wcs_requests(bbox, (8, 8), &GridSpec::Explicit { rows: 1, cols: 1 });

    let mut registry = DecoderRegistry::empty();
    registry.register(OutputFormat::Binary, |_, _| {
        // 15 rows is not divisible by the 8 requested
        Ok(Array2::from_elem((15, 16), 1.0))
    });

    let array = Assembler::new(Arc::new(StubFetcher::new()), Arc::new(registry))
        .assemble(requests, shape, attrs(Crs::Epsg4326))
        .unwrap();

    let result = array.compute().await;
    assert!(matches!(result, Err(Error::ShapeMismatch(_))));
}

#[tokio::test]
async fn test_decode_error_is_soft() {
    let bbox = BoundingBox::new(0.0, 0.0, 2.0, 1.0, Crs::Epsg4326).unwrap();
    let (requests, shape) = wcs_requests(bbox, (4, 4), &GridSpec::Explicit { rows: 1, cols: 2 });

    let mut registry = DecoderRegistry::empty();
    registry.register(OutputFormat::Binary, |response, request| {
        // Reject the western tile's bytes, decode the rest normally
        if request.bbox.min_x < 0.5 {
            return Err(Error::Decode("corrupt tile bytes".into()));
        }
        crate::decode::decode_binary(response, request)
    });

    let array = Assembler::new(Arc::new(StubFetcher::new()), Arc::new(registry))
        .assemble(requests, shape, attrs(Crs::Epsg4326))
        .unwrap();

    let loaded = array.compute().await.unwrap();
    assert_eq!(loaded.shape(), (4, 8));
    // West half NaN, east half decoded
    assert!(loaded.data[[0, 0]].is_nan());
    assert_eq!(loaded.data[[0, 7]], 1.0);
    assert_eq!(loaded.nan_count(), 16);
}

#[tokio::test]
async fn test_resolution_mode_end_to_end() {
    // 1000x1000 units at 1 unit/px with 500px chunks -> 2x2 grid of 500x500
    let bbox = BoundingBox::new(0.0, 0.0, 1000.0, 1000.0, Crs::Epsg3857).unwrap();
    let (requests, shape) = wcs_requests(
        bbox,
        (500, 500),
        &GridSpec::Resolution {
            res_x: 1.0,
            res_y: 1.0,
        },
    );

    assert_eq!(shape, (2, 2));
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|r| r.width == 500 && r.height == 500));

    let array = Assembler::new(
        Arc::new(StubFetcher::new()),
        Arc::new(DecoderRegistry::default()),
    )
    .assemble(requests, shape, attrs(Crs::Epsg3857))
    .unwrap();

    assert_eq!(array.shape(), (1000, 1000));
}

#[test]
fn test_wcs_requests_carry_projected_axis_labels() {
    let bbox = BoundingBox::new(0.0, 0.0, 1000.0, 1000.0, Crs::Epsg3857).unwrap();
    let (requests, _) = wcs_requests(bbox, (500, 500), &GridSpec::Explicit { rows: 1, cols: 1 });

    let subsets: Vec<&str> = requests[0]
        .params
        .iter()
        .filter(|(k, _)| k == "subset")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(subsets, vec!["X(0,1000)", "Y(0,1000)"]);
}
