//! Bounding box and coordinate reference system value types.
//!
//! ## Coordinate order convention:
//!
//! - Bounding boxes are `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]`
//! - For EPSG:4326: x is longitude, y is latitude, both in degrees
//!
//! Reprojection is pure Rust (proj4rs + crs-definitions); no native PROJ
//! installation is required. Transforms are resolved per (source, target)
//! CRS pair and cached, since building projection objects is not free.

use crate::error::{Error, Result};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Coordinate reference systems accepted by the tile services this crate
/// targets. Equality is by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// WGS84 geographic coordinates (lon/lat in degrees).
    #[serde(rename = "EPSG:4326")]
    Epsg4326,

    /// Web Mercator (x/y in meters).
    #[serde(rename = "EPSG:3857")]
    Epsg3857,

    /// UTM zone 33N (easting/northing in meters).
    #[serde(rename = "EPSG:32633")]
    Epsg32633,

    /// British National Grid (easting/northing in meters).
    #[serde(rename = "EPSG:27700")]
    Epsg27700,
}

impl Default for Crs {
    fn default() -> Self {
        Crs::Epsg4326
    }
}

impl Crs {
    /// The registry code, e.g. "EPSG:4326".
    pub fn as_code(&self) -> &'static str {
        match self {
            Crs::Epsg4326 => "EPSG:4326",
            Crs::Epsg3857 => "EPSG:3857",
            Crs::Epsg32633 => "EPSG:32633",
            Crs::Epsg27700 => "EPSG:27700",
        }
    }

    /// Numeric EPSG code.
    pub fn epsg(&self) -> u16 {
        match self {
            Crs::Epsg4326 => 4326,
            Crs::Epsg3857 => 3857,
            Crs::Epsg32633 => 32633,
            Crs::Epsg27700 => 27700,
        }
    }

    /// Look up a CRS by numeric EPSG code.
    pub fn from_epsg(code: u16) -> Result<Self> {
        match code {
            4326 => Ok(Crs::Epsg4326),
            3857 => Ok(Crs::Epsg3857),
            32633 => Ok(Crs::Epsg32633),
            27700 => Ok(Crs::Epsg27700),
            other => Err(Error::UnsupportedCrs(format!("EPSG:{}", other))),
        }
    }

    /// Whether coordinates are geographic degrees (lon/lat) rather than
    /// projected meters.
    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Epsg4326)
    }
}

impl FromStr for Crs {
    type Err = Error;

    /// Accepts "EPSG:nnnn" (case-insensitive prefix) or a bare integer.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let code = if let Some(rest) = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
        {
            rest
        } else {
            trimmed
        };
        code.parse::<u16>()
            .map_err(|_| Error::UnsupportedCrs(s.to_string()))
            .and_then(Crs::from_epsg)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Thread-safe cache of projection pairs.
///
/// Building proj4rs projection objects involves parsing PROJ definition
/// strings, so pairs are cached by (source, target).
#[derive(Default)]
pub struct ProjCache {
    cache: RwLock<HashMap<(Crs, Crs), Arc<(Proj, Proj)>>>,
}

impl ProjCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the projection pair for a transform.
    fn get(&self, from: Crs, to: Crs) -> Result<Arc<(Proj, Proj)>> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(pair) = cache.get(&(from, to)) {
                return Ok(pair.clone());
            }
        }

        let pair = Arc::new((build_proj(from)?, build_proj(to)?));

        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert((from, to), pair.clone());
        }

        Ok(pair)
    }
}

/// Build a proj4rs projection from the crs-definitions database.
fn build_proj(crs: Crs) -> Result<Proj> {
    let def = crs_definitions::from_code(crs.epsg()).ok_or_else(|| {
        Error::Projection(format!("{} is not in the crs-definitions database", crs))
    })?;
    Proj::from_proj_string(def.proj4)
        .map_err(|e| Error::Projection(format!("Invalid projection for {}: {:?}", crs, e)))
}

/// Transform a single point between CRS.
pub fn transform_point(x: f64, y: f64, from: Crs, to: Crs, cache: &ProjCache) -> Result<(f64, f64)> {
    if from == to {
        return Ok((x, y));
    }

    let pair = cache.get(from, to)?;

    // proj4rs works in radians for geographic CRS
    let (x_in, y_in) = if from.is_geographic() {
        (x.to_radians(), y.to_radians())
    } else {
        (x, y)
    };

    let mut point = (x_in, y_in, 0.0);
    transform(&pair.0, &pair.1, &mut point).map_err(|e| {
        Error::Projection(format!(
            "Transform ({}, {}) from {} to {} failed: {:?}",
            x, y, from, to, e
        ))
    })?;

    if to.is_geographic() {
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    } else {
        Ok((point.0, point.1))
    }
}

/// Axis-aligned geographic rectangle in a specific CRS.
///
/// Immutable: operations that change the extent return a new value.
/// The `min < max` invariant on both axes holds for every constructed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// West edge.
    pub min_x: f64,

    /// South edge.
    pub min_y: f64,

    /// East edge.
    pub max_x: f64,

    /// North edge.
    pub max_y: f64,

    /// CRS in which all four coordinates are expressed.
    #[serde(default)]
    pub crs: Crs,
}

impl BoundingBox {
    /// Create a bounding box, enforcing `min_x < max_x` and `min_y < max_y`.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64, crs: Crs) -> Result<Self> {
        if !min_x.is_finite() || !min_y.is_finite() || !max_x.is_finite() || !max_y.is_finite() {
            return Err(Error::InvalidBounds(format!(
                "coordinates must be finite, got [{}, {}, {}, {}]",
                min_x, min_y, max_x, max_y
            )));
        }
        if min_x >= max_x {
            return Err(Error::InvalidBounds(format!(
                "min_x ({}) must be less than max_x ({})",
                min_x, max_x
            )));
        }
        if min_y >= max_y {
            return Err(Error::InvalidBounds(format!(
                "min_y ({}) must be less than max_y ({})",
                min_y, max_y
            )));
        }
        Ok(Self {
            min_x,
            min_y,
            max_x,
            max_y,
            crs,
        })
    }

    /// Extent along the x axis, in CRS units.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Extent along the y axis, in CRS units.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Whether two boxes overlap (shared edges count as touching).
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    /// Smallest box covering both inputs. The CRS must match.
    pub fn union(&self, other: &BoundingBox) -> Result<BoundingBox> {
        if self.crs != other.crs {
            return Err(Error::InvalidBounds(format!(
                "cannot union bounding boxes with different CRS: {} vs {}",
                self.crs, other.crs
            )));
        }
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
            self.crs,
        )
    }

    /// Overlapping region of two boxes, or None when they are disjoint.
    /// The CRS must match.
    pub fn intersection(&self, other: &BoundingBox) -> Result<Option<BoundingBox>> {
        if self.crs != other.crs {
            return Err(Error::InvalidBounds(format!(
                "cannot intersect bounding boxes with different CRS: {} vs {}",
                self.crs, other.crs
            )));
        }
        if !self.intersects(other) {
            return Ok(None);
        }
        let min_x = self.min_x.max(other.min_x);
        let min_y = self.min_y.max(other.min_y);
        let max_x = self.max_x.min(other.max_x);
        let max_y = self.max_y.min(other.max_y);
        if min_x < max_x && min_y < max_y {
            Ok(Some(BoundingBox::new(min_x, min_y, max_x, max_y, self.crs)?))
        } else {
            Ok(None)
        }
    }

    /// Reproject into another CRS.
    ///
    /// Transforms all 4 corners and returns the envelope of the result,
    /// which handles projection distortion for the modest extents this
    /// crate works with. Identity when the target CRS matches.
    pub fn reproject(&self, target: Crs) -> Result<BoundingBox> {
        if self.crs == target {
            return Ok(*self);
        }

        let cache = ProjCache::new();
        let corners = [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ];

        let mut min_x = f64::MAX;
        let mut min_y = f64::MAX;
        let mut max_x = f64::MIN;
        let mut max_y = f64::MIN;

        for (x, y) in corners {
            let (tx, ty) = transform_point(x, y, self.crs, target, &cache)?;
            min_x = min_x.min(tx);
            min_y = min_y.min(ty);
            max_x = max_x.max(tx);
            max_y = max_y.max(ty);
        }

        BoundingBox::new(min_x, min_y, max_x, max_y, target)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.6}, {:.6}, {:.6}, {:.6}] ({})",
            self.min_x, self.min_y, self.max_x, self.max_y, self.crs
        )
    }
}
