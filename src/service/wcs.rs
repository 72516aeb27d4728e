//! Web Coverage Service (WCS 2.0) adapter and capabilities client.
//!
//! The adapter builds `GetCoverage` requests that encode a tile's sub-bbox
//! as two independent axis subset expressions. Axis labels depend on the
//! subsetting CRS: a fixed lookup table maps EPSG:27700 to `E`/`N` and
//! EPSG:3857 to `X`/`Y`; every other CRS uses the geographic `Long`/`Lat`
//! labels.

use super::{
    merge_params, OutputFormat, RequestOptions, ServiceAdapter, ServiceKind, TileRequest,
};
use crate::error::{Error, Result};
use crate::geo::{BoundingBox, Crs};
use crate::grid::TileGeometry;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Default WCS protocol version.
const WCS_VERSION: &str = "2.0.1";

/// Adapter for WCS `GetCoverage` tile requests.
#[derive(Debug, Clone)]
pub struct WcsAdapter {
    base_url: String,
    version: String,
    coverage_id: Option<String>,
    output_format: OutputFormat,
}

impl WcsAdapter {
    /// Create an adapter for a WCS endpoint.
    pub fn new(base_url: impl Into<String>, coverage_id: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches(&['/', '?'][..]).to_string(),
            version: WCS_VERSION.to_string(),
            coverage_id,
            output_format: OutputFormat::default(),
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

    /// Axis labels for the subset expressions, by subsetting CRS.
    fn subset_axes(crs: Crs) -> (&'static str, &'static str) {
        match crs {
            Crs::Epsg27700 => ("E", "N"),
            Crs::Epsg3857 => ("X", "Y"),
            _ => ("Long", "Lat"),
        }
    }

    /// Render the two axis subset expressions for a bbox.
    fn format_subset(bbox: &BoundingBox, crs: Crs) -> [(String, String); 2] {
        let (axis_x, axis_y) = Self::subset_axes(crs);
        [
            (
                "subset".to_string(),
                format!("{}({},{})", axis_x, bbox.min_x, bbox.max_x),
            ),
            (
                "subset".to_string(),
                format!("{}({},{})", axis_y, bbox.min_y, bbox.max_y),
            ),
        ]
    }
}

impl ServiceAdapter for WcsAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Wcs
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn coverage_id(&self) -> Option<&str> {
        self.coverage_id.as_deref()
    }

    fn build_tile_request(
        &self,
        tile: &TileGeometry,
        options: &RequestOptions,
    ) -> Result<TileRequest> {
        let coverage = options
            .coverage_id
            .as_deref()
            .or(self.coverage_id.as_deref())
            .ok_or(Error::MissingCoverageId)?;

        let format = options.output_format.unwrap_or(self.output_format);
        let crs = options.crs.unwrap_or(tile.crs);
        let [subset_x, subset_y] = Self::format_subset(&tile.bbox, crs);

        let params = vec![
            ("service".to_string(), "WCS".to_string()),
            ("version".to_string(), self.version.clone()),
            ("request".to_string(), "GetCoverage".to_string()),
            ("coverageId".to_string(), coverage.to_string()),
            subset_x,
            subset_y,
            ("format".to_string(), format.as_mime().to_string()),
            ("width".to_string(), tile.width.to_string()),
            ("height".to_string(), tile.height.to_string()),
            ("subsettingCRS".to_string(), crs.as_code().to_string()),
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

/// Service-level metadata advertised by a WCS endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCapabilities {
    /// Human-readable service title.
    pub title: String,

    /// Coverages offered by the service.
    pub coverages: Vec<CoverageSummary>,
}

/// One coverage listed in a capabilities document.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageSummary {
    /// Coverage identifier used in requests.
    pub identifier: String,

    /// Optional human-readable title.
    pub title: Option<String>,
}

/// Detailed description of a single coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageDescription {
    /// Coverage identifier.
    pub identifier: String,

    /// Spatial extent, when the document carries an envelope.
    pub extent: Option<BoundingBox>,

    /// Native format, when advertised and recognized.
    pub native_format: Option<OutputFormat>,

    /// Formats the coverage can be requested in.
    pub supported_formats: Vec<OutputFormat>,

    /// CRS the coverage can be subset in.
    pub supported_crs: Vec<Crs>,
}

/// Client for WCS metadata operations.
///
/// The tile pipeline itself only consumes a coverage identifier and
/// optionally a native format/CRS from these responses.
pub struct WcsClient {
    client: reqwest::Client,
    base_url: String,
    version: String,
}

impl WcsClient {
    /// Create a client for a WCS endpoint.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches(&['/', '?'][..]).to_string(),
            version: WCS_VERSION.to_string(),
        }
    }

    /// Fetch and parse the service capabilities.
    pub async fn get_capabilities(&self) -> Result<ServiceCapabilities> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("service", "WCS"),
                ("version", self.version.as_str()),
                ("request", "GetCapabilities"),
            ])
            .send()
            .await
            .map_err(|e| Error::Capabilities(format!("GetCapabilities request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Capabilities(format!(
                "GetCapabilities returned HTTP {}",
                status
            )));
        }

        let xml = response
            .text()
            .await
            .map_err(|e| Error::Capabilities(format!("reading capabilities body: {}", e)))?;
        parse_capabilities(&xml)
    }

    /// Fetch and parse the description of one coverage.
    pub async fn describe_coverage(&self, coverage_id: &str) -> Result<CoverageDescription> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("service", "WCS"),
                ("version", self.version.as_str()),
                ("request", "DescribeCoverage"),
                ("coverageId", coverage_id),
            ])
            .send()
            .await
            .map_err(|e| Error::Capabilities(format!("DescribeCoverage request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Capabilities(format!(
                "DescribeCoverage returned HTTP {}",
                status
            )));
        }

        let xml = response
            .text()
            .await
            .map_err(|e| Error::Capabilities(format!("reading coverage body: {}", e)))?;
        parse_coverage_description(&xml)
    }
}

/// Parse a GetCapabilities XML document.
///
/// Namespace prefixes vary across servers, so elements are matched by local
/// name only.
pub fn parse_capabilities(xml: &str) -> Result<ServiceCapabilities> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut title: Option<String> = None;
    let mut coverages = Vec::new();

    let mut in_summary = false;
    let mut summary_id: Option<String> = None;
    let mut summary_title: Option<String> = None;
    // Which element's text we are about to read
    let mut pending: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"CoverageSummary" => {
                    in_summary = true;
                    summary_id = None;
                    summary_title = None;
                }
                b"CoverageId" | b"Identifier" if in_summary => pending = Some("id"),
                b"Title" => {
                    pending = if in_summary {
                        Some("summary_title")
                    } else if title.is_none() {
                        Some("service_title")
                    } else {
                        None
                    };
                }
                _ => pending = None,
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::Capabilities(format!("invalid XML text: {}", e)))?
                    .trim()
                    .to_string();
                match pending.take() {
                    Some("id") => summary_id = Some(text),
                    Some("summary_title") => summary_title = Some(text),
                    Some("service_title") => title = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"CoverageSummary" {
                    in_summary = false;
                    if let Some(identifier) = summary_id.take() {
                        coverages.push(CoverageSummary {
                            identifier,
                            title: summary_title.take(),
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::Capabilities(format!("invalid capabilities XML: {}", e)))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(ServiceCapabilities {
        title: title.unwrap_or_else(|| "WCS Service".to_string()),
        coverages,
    })
}

/// Parse a DescribeCoverage XML document.
pub fn parse_coverage_description(xml: &str) -> Result<CoverageDescription> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut identifier: Option<String> = None;
    let mut lower_corner: Option<(f64, f64)> = None;
    let mut upper_corner: Option<(f64, f64)> = None;
    let mut native_format = None;
    let mut supported_formats = Vec::new();
    let mut supported_crs = Vec::new();
    let mut pending: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                pending = match e.local_name().as_ref() {
                    b"CoverageId" | b"Identifier" => Some("id"),
                    b"lowerCorner" => Some("lower"),
                    b"upperCorner" => Some("upper"),
                    b"nativeFormat" | b"NativeFormat" => Some("native_format"),
                    b"SupportedFormat" | b"formatSupported" => Some("format"),
                    b"SupportedCRS" | b"crsSupported" => Some("crs"),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::Capabilities(format!("invalid XML text: {}", e)))?
                    .trim()
                    .to_string();
                match pending.take() {
                    Some("id") => {
                        if identifier.is_none() {
                            identifier = Some(text);
                        }
                    }
                    Some("lower") => lower_corner = parse_corner(&text),
                    Some("upper") => upper_corner = parse_corner(&text),
                    // Formats and CRS the enum does not know are skipped,
                    // not errors: servers advertise far more than we speak
                    Some("native_format") => native_format = text.parse().ok(),
                    Some("format") => {
                        if let Ok(format) = text.parse() {
                            supported_formats.push(format);
                        }
                    }
                    Some("crs") => {
                        if let Ok(crs) = parse_crs_urn(&text) {
                            supported_crs.push(crs);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Capabilities(format!("invalid coverage XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    let identifier =
        identifier.ok_or_else(|| Error::Capabilities("coverage identifier not found".into()))?;

    let extent = match (lower_corner, upper_corner) {
        (Some((min_x, min_y)), Some((max_x, max_y))) => {
            BoundingBox::new(min_x, min_y, max_x, max_y, Crs::Epsg4326).ok()
        }
        _ => None,
    };

    Ok(CoverageDescription {
        identifier,
        extent,
        native_format,
        supported_formats,
        supported_crs,
    })
}

fn parse_corner(text: &str) -> Option<(f64, f64)> {
    let mut parts = text.split_whitespace();
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    Some((a, b))
}

/// Accepts both "EPSG:4326" and OGC URN forms like
/// "urn:ogc:def:crs:EPSG::4326" or ".../def/crs/EPSG/0/4326".
fn parse_crs_urn(text: &str) -> Result<Crs> {
    if let Ok(crs) = text.parse() {
        return Ok(crs);
    }
    let tail = text.rsplit([':', '/']).next().unwrap_or(text);
    tail.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::TileGeometry;

    fn tile(min_x: f64, min_y: f64, max_x: f64, max_y: f64, crs: Crs) -> TileGeometry {
        TileGeometry::new(
            BoundingBox::new(min_x, min_y, max_x, max_y, crs).unwrap(),
            256,
            128,
        )
        .unwrap()
    }

    fn param<'a>(request: &'a TileRequest, key: &str) -> Vec<&'a str> {
        request
            .params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn test_build_request_geographic_axes() {
        let adapter = WcsAdapter::new("http://example.com/wcs", Some("elevation".into()));
        let request = adapter
            .build_tile_request(
                &tile(-1.0, 50.0, -0.5, 50.5, Crs::Epsg4326),
                &RequestOptions::default(),
            )
            .unwrap();

        assert_eq!(request.url, "http://example.com/wcs");
        assert_eq!(param(&request, "service"), vec!["WCS"]);
        assert_eq!(param(&request, "request"), vec!["GetCoverage"]);
        assert_eq!(param(&request, "coverageId"), vec!["elevation"]);
        assert_eq!(
            param(&request, "subset"),
            vec!["Long(-1,-0.5)", "Lat(50,50.5)"]
        );
        assert_eq!(param(&request, "subsettingCRS"), vec!["EPSG:4326"]);
        assert_eq!(param(&request, "width"), vec!["256"]);
        assert_eq!(param(&request, "height"), vec!["128"]);
    }

    #[test]
    fn test_axis_label_table() {
        assert_eq!(WcsAdapter::subset_axes(Crs::Epsg27700), ("E", "N"));
        assert_eq!(WcsAdapter::subset_axes(Crs::Epsg3857), ("X", "Y"));
        assert_eq!(WcsAdapter::subset_axes(Crs::Epsg4326), ("Long", "Lat"));
        // Unknown-to-the-table CRS fall back to geographic labels
        assert_eq!(WcsAdapter::subset_axes(Crs::Epsg32633), ("Long", "Lat"));
    }

    #[test]
    fn test_projected_subset_expressions() {
        let adapter = WcsAdapter::new("http://example.com/wcs", Some("dsm".into()));
        let request = adapter
            .build_tile_request(
                &tile(400000.0, 100000.0, 410000.0, 110000.0, Crs::Epsg27700),
                &RequestOptions::default(),
            )
            .unwrap();

        assert_eq!(
            param(&request, "subset"),
            vec!["E(400000,410000)", "N(100000,110000)"]
        );
    }

    #[test]
    fn test_missing_coverage_id() {
        let adapter = WcsAdapter::new("http://example.com/wcs", None);
        let result = adapter.build_tile_request(
            &tile(0.0, 0.0, 1.0, 1.0, Crs::Epsg4326),
            &RequestOptions::default(),
        );
        assert!(matches!(result, Err(Error::MissingCoverageId)));
    }

    #[test]
    fn test_options_override_coverage_and_format() {
        let adapter = WcsAdapter::new("http://example.com/wcs", Some("default-cov".into()));
        let options = RequestOptions {
            coverage_id: Some("override-cov".into()),
            output_format: Some(OutputFormat::Png),
            params: vec![("interpolation".into(), "nearest".into())],
            ..Default::default()
        };
        let request = adapter
            .build_tile_request(&tile(0.0, 0.0, 1.0, 1.0, Crs::Epsg4326), &options)
            .unwrap();

        assert_eq!(param(&request, "coverageId"), vec!["override-cov"]);
        assert_eq!(param(&request, "format"), vec!["image/png"]);
        assert_eq!(param(&request, "interpolation"), vec!["nearest"]);
        assert_eq!(request.output_format, OutputFormat::Png);
    }

    #[test]
    fn test_parse_capabilities() {
        let xml = r#"<?xml version="1.0"?>
<wcs:Capabilities xmlns:wcs="http://www.opengis.net/wcs/2.0" xmlns:ows="http://www.opengis.net/ows/1.1">
  <ows:ServiceIdentification>
    <ows:Title>Test Coverage Server</ows:Title>
  </ows:ServiceIdentification>
  <wcs:Contents>
    <wcs:CoverageSummary>
      <wcs:CoverageId>elevation</wcs:CoverageId>
      <ows:Title>Elevation model</ows:Title>
    </wcs:CoverageSummary>
    <wcs:CoverageSummary>
      <wcs:CoverageId>landcover</wcs:CoverageId>
    </wcs:CoverageSummary>
  </wcs:Contents>
</wcs:Capabilities>"#;

        let caps = parse_capabilities(xml).unwrap();
        assert_eq!(caps.title, "Test Coverage Server");
        assert_eq!(caps.coverages.len(), 2);
        assert_eq!(caps.coverages[0].identifier, "elevation");
        assert_eq!(caps.coverages[0].title.as_deref(), Some("Elevation model"));
        assert_eq!(caps.coverages[1].identifier, "landcover");
        assert!(caps.coverages[1].title.is_none());
    }

    #[test]
    fn test_parse_coverage_description() {
        let xml = r#"<?xml version="1.0"?>
<wcs:CoverageDescriptions xmlns:wcs="http://www.opengis.net/wcs/2.0" xmlns:gml="http://www.opengis.net/gml/3.2">
  <wcs:CoverageDescription>
    <wcs:CoverageId>elevation</wcs:CoverageId>
    <gml:boundedBy>
      <gml:Envelope>
        <gml:lowerCorner>-1.0 50.0</gml:lowerCorner>
        <gml:upperCorner>1.0 52.0</gml:upperCorner>
      </gml:Envelope>
    </gml:boundedBy>
    <wcs:ServiceParameters>
      <wcs:nativeFormat>image/tiff</wcs:nativeFormat>
    </wcs:ServiceParameters>
  </wcs:CoverageDescription>
</wcs:CoverageDescriptions>"#;

        let description = parse_coverage_description(xml).unwrap();
        assert_eq!(description.identifier, "elevation");
        assert_eq!(description.native_format, Some(OutputFormat::GeoTiff));
        let extent = description.extent.unwrap();
        assert_eq!(extent.min_x, -1.0);
        assert_eq!(extent.max_y, 52.0);
    }

    #[test]
    fn test_parse_crs_urn_forms() {
        assert_eq!(parse_crs_urn("EPSG:4326").unwrap(), Crs::Epsg4326);
        assert_eq!(
            parse_crs_urn("urn:ogc:def:crs:EPSG::3857").unwrap(),
            Crs::Epsg3857
        );
        assert_eq!(
            parse_crs_urn("http://www.opengis.net/def/crs/EPSG/0/27700").unwrap(),
            Crs::Epsg27700
        );
        assert!(parse_crs_urn("urn:ogc:def:crs:EPSG::99999").is_err());
    }

    #[test]
    fn test_parse_capabilities_invalid_xml() {
        assert!(parse_coverage_description("<unclosed").is_err());
    }
}
