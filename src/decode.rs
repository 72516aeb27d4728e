//! Tile decoding: raw response bytes to dense 2-D arrays.
//!
//! Decoders are looked up by output format in an explicit registry owned by
//! the assembler for the duration of one load. There is no process-global
//! decoder table: each load (and each test) gets its own registry.
//!
//! Decoders return exactly two dimensions. Multi-band sources are flattened
//! to their first band here so the assembler can assume `(height, width)`.

use crate::error::{Error, Result};
use crate::fetch::TileResponse;
use crate::service::{OutputFormat, TileRequest};
use ndarray::Array2;
use std::collections::HashMap;
use std::io::Cursor;

/// A tile decoder: raw bytes in one format to a dense 2-D array.
pub type Decoder =
    Box<dyn Fn(&TileResponse, &TileRequest) -> Result<Array2<f32>> + Send + Sync>;

/// Format-keyed decoder table with deterministic lifecycle: populated before
/// a load starts, immutable while it runs.
pub struct DecoderRegistry {
    decoders: HashMap<OutputFormat, Decoder>,
}

impl DecoderRegistry {
    /// Registry with no decoders. Useful for tests and exotic formats.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register (or replace) the decoder for a format.
    pub fn register<F>(&mut self, format: OutputFormat, decoder: F)
    where
        F: Fn(&TileResponse, &TileRequest) -> Result<Array2<f32>> + Send + Sync + 'static,
    {
        self.decoders.insert(format, Box::new(decoder));
    }

    /// Whether a decoder exists for the format.
    pub fn contains(&self, format: OutputFormat) -> bool {
        self.decoders.contains_key(&format)
    }

    /// Look up the decoder for a format.
    pub fn get(&self, format: OutputFormat) -> Result<&Decoder> {
        self.decoders
            .get(&format)
            .ok_or_else(|| Error::NoDecoder(format.as_mime().to_string()))
    }
}

impl Default for DecoderRegistry {
    /// Registry with the built-in GeoTIFF, PNG, and raw-f32 decoders.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(OutputFormat::GeoTiff, |response, request| {
            decode_geotiff(response, request)
        });
        registry.register(OutputFormat::Png, |response, request| {
            decode_png(response, request)
        });
        registry.register(OutputFormat::Binary, |response, request| {
            decode_binary(response, request)
        });
        registry
    }
}

/// Decode a (Geo)TIFF tile, flattening multi-band data to the first band.
pub fn decode_geotiff(response: &TileResponse, _request: &TileRequest) -> Result<Array2<f32>> {
    let mut decoder = tiff::decoder::Decoder::new(Cursor::new(response.data.as_ref()))
        .map_err(|e| Error::Decode(format!("not a TIFF: {}", e)))?;

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| Error::Decode(format!("TIFF dimensions: {}", e)))?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Err(Error::Decode("TIFF has zero-sized dimensions".into()));
    }

    let image = decoder
        .read_image()
        .map_err(|e| Error::Decode(format!("TIFF read: {}", e)))?;

    use tiff::decoder::DecodingResult;
    let values: Vec<f32> = match image {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
    };

    let pixels = width * height;
    if values.len() % pixels != 0 {
        return Err(Error::Decode(format!(
            "TIFF sample count {} does not fit {}x{} image",
            values.len(),
            width,
            height
        )));
    }

    // Interleaved bands: keep the first sample of each pixel
    let bands = values.len() / pixels;
    let first_band: Vec<f32> = if bands == 1 {
        values
    } else {
        values.into_iter().step_by(bands).collect()
    };

    Array2::from_shape_vec((height, width), first_band)
        .map_err(|e| Error::Decode(format!("TIFF shape: {}", e)))
}

/// Decode a PNG (or JPEG) tile to its luma channel.
pub fn decode_png(response: &TileResponse, _request: &TileRequest) -> Result<Array2<f32>> {
    let image = image::load_from_memory(response.data.as_ref())
        .map_err(|e| Error::Decode(format!("not a decodable image: {}", e)))?;

    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let values: Vec<f32> = gray.into_raw().into_iter().map(f32::from).collect();

    Array2::from_shape_vec((height as usize, width as usize), values)
        .map_err(|e| Error::Decode(format!("image shape: {}", e)))
}

/// Decode a raw little-endian f32 grid of exactly width*height values.
pub fn decode_binary(response: &TileResponse, request: &TileRequest) -> Result<Array2<f32>> {
    let (width, height) = (request.width as usize, request.height as usize);
    let expected = width * height * 4;
    if response.data.len() != expected {
        return Err(Error::Decode(format!(
            "raw tile is {} bytes, expected {} for {}x{} f32 grid",
            response.data.len(),
            expected,
            width,
            height
        )));
    }

    let values: Vec<f32> = response
        .data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Array2::from_shape_vec((height, width), values)
        .map_err(|e| Error::Decode(format!("raw shape: {}", e)))
}

/// Reduce an over-resolved decoded tile to its requested shape by averaging
/// equal-sized blocks.
///
/// The decoded shape must be an exact integer multiple of the target shape
/// on both axes; anything else (including an undersized input, which cannot
/// be upsampled) is a structural shape error, not a soft per-tile failure.
/// Exact-match input passes through unchanged.
pub fn downsample_mean(data: Array2<f32>, target_h: usize, target_w: usize) -> Result<Array2<f32>> {
    let (h, w) = data.dim();
    if h == target_h && w == target_w {
        return Ok(data);
    }
    if h < target_h || w < target_w {
        return Err(Error::ShapeMismatch(format!(
            "decoded shape ({}, {}) is smaller than requested ({}, {}); cannot upsample",
            h, w, target_h, target_w
        )));
    }
    if target_h == 0 || target_w == 0 || h % target_h != 0 || w % target_w != 0 {
        return Err(Error::ShapeMismatch(format!(
            "decoded shape ({}, {}) is not an integer multiple of requested ({}, {})",
            h, w, target_h, target_w
        )));
    }

    let factor_y = h / target_h;
    let factor_x = w / target_w;
    let block = (factor_y * factor_x) as f64;

    let mut out = Array2::zeros((target_h, target_w));
    for row in 0..target_h {
        for col in 0..target_w {
            let mut sum = 0.0f64;
            for dy in 0..factor_y {
                for dx in 0..factor_x {
                    sum += data[[row * factor_y + dy, col * factor_x + dx]] as f64;
                }
            }
            out[[row, col]] = (sum / block) as f32;
        }
    }

    Ok(out)
}
