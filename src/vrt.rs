//! Parser for GDAL-style VRT mosaic manifests.
//!
//! A manifest describes a virtual mosaic: overall raster dimensions, a
//! spatial reference string, an affine transform, and one `SimpleSource`
//! entry per payload giving its pixel position in the mosaic. The parser is a
//! pure transformation; payload paths are resolved but never probed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use crate::error::{SwtError, SwtResult};

/// One source entry of the mosaic: a payload path plus its pixel offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Resolved payload path.
    pub path: PathBuf,
    /// Horizontal pixel offset in the mosaic grid.
    pub x_off: u64,
    /// Vertical pixel offset in the mosaic grid.
    pub y_off: u64,
}

/// Normalized content of a mosaic manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct VrtInfo {
    /// Mosaic width in pixels.
    pub raster_x: u64,
    /// Mosaic height in pixels.
    pub raster_y: u64,
    /// Easting of the mosaic's left edge.
    pub origin_e: f64,
    /// Northing of the mosaic's top edge.
    pub origin_n: f64,
    /// Ground resolution in metres per pixel, always positive.
    pub pixel_size: f64,
    /// CRS code reduced from the manifest's spatial reference string.
    pub crs_code: u32,
    /// Tile placements, unique by pixel offset.
    pub placements: Vec<Placement>,
}

static AUTHORITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)AUTHORITY\s*\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#).expect("valid regex")
});

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:EPSG|CRS)\s*:\s*(\d+)").expect("valid regex"));

/// Reduces a spatial reference string to a positive integer CRS code.
///
/// Rules are tried in order: the last explicit `AUTHORITY["EPSG","NNNN"]`
/// clause, a bare `EPSG:NNNN` / `CRS:NNNN` substring, and finally the
/// well-known Swedish TM projection, which maps to 3006.
#[must_use]
pub fn reduce_crs(srs: &str) -> Option<u32> {
    if let Some(code) = AUTHORITY_RE
        .captures_iter(srs)
        .last()
        .and_then(|cap| cap[1].parse::<u32>().ok())
        .filter(|&code| code > 0)
    {
        return Some(code);
    }
    if let Some(code) = CODE_RE
        .captures(srs)
        .and_then(|cap| cap[1].parse::<u32>().ok())
        .filter(|&code| code > 0)
    {
        return Some(code);
    }
    if srs.to_ascii_uppercase().contains("SWEREF99") {
        return Some(3006);
    }
    None
}

fn malformed(err: impl std::fmt::Display) -> SwtError {
    SwtError::ManifestMalformed(err.to_string())
}

fn required_int_attr(element: &BytesStart<'_>, name: &str) -> SwtResult<u64> {
    let value = element
        .try_get_attribute(name)
        .map_err(malformed)?
        .ok_or_else(|| malformed(format!("missing attribute {name}")))?;
    let value = value.unescape_value().map_err(malformed)?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| malformed(format!("attribute {name} is not an integer: {value}")))
}

/// Reads `xOff`/`yOff` from a `DstRect` element. Offsets may be written in
/// decimal form (`"1000.0"`); missing attributes yield `None` so the entry is
/// skipped like a missing `DstRect`.
fn dst_offsets(element: &BytesStart<'_>) -> SwtResult<Option<(u64, u64)>> {
    let mut offsets = [0u64; 2];
    for (slot, name) in offsets.iter_mut().zip(["xOff", "yOff"]) {
        let Some(attr) = element.try_get_attribute(name).map_err(malformed)? else {
            return Ok(None);
        };
        let value = attr.unescape_value().map_err(malformed)?;
        let parsed = value
            .trim()
            .parse::<f64>()
            .map_err(|_| malformed(format!("attribute {name} is not numeric: {value}")))?;
        if !parsed.is_finite() || parsed < 0.0 {
            return Err(malformed(format!("attribute {name} is out of range: {value}")));
        }
        *slot = parsed as u64;
    }
    Ok(Some((offsets[0], offsets[1])))
}

fn parse_geo_transform(text: &str) -> SwtResult<(f64, f64, f64, f64)> {
    let parts: Vec<f64> = text
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed(format!("GeoTransform is not numeric: {text}")))?;
    if parts.len() != 6 {
        return Err(malformed(format!(
            "GeoTransform has {} coefficients, expected 6",
            parts.len()
        )));
    }
    Ok((parts[0], parts[1], parts[3], parts[5]))
}

enum TextTarget {
    None,
    Srs,
    GeoTransform,
    SourceFilename,
}

impl VrtInfo {
    /// Reads and parses a manifest file. Relative payload paths resolve
    /// against the manifest's directory.
    ///
    /// # Errors
    ///
    /// [`SwtError::ManifestMalformed`] per the rules of [`VrtInfo::parse`];
    /// I/O failures opening the manifest pass through as [`SwtError::Io`].
    pub fn from_file(path: &Path) -> SwtResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
    }

    /// Parses manifest XML, resolving relative payload paths against
    /// `base_dir`.
    ///
    /// Sources repeated across raster bands collapse to one placement per
    /// pixel offset (last occurrence wins). Sources missing `SourceFilename`
    /// or `DstRect` are skipped silently.
    ///
    /// # Errors
    ///
    /// [`SwtError::ManifestMalformed`] on structural XML errors, missing
    /// required elements or attributes, non-numeric numeric attributes, a
    /// non-positive pixel size, or a spatial reference that cannot be reduced
    /// to a positive CRS code.
    pub fn parse(xml: &str, base_dir: &Path) -> SwtResult<Self> {
        let mut reader = Reader::from_str(xml);

        let mut raster: Option<(u64, u64)> = None;
        let mut srs: Option<String> = None;
        let mut transform: Option<(f64, f64, f64, f64)> = None;
        let mut placements: BTreeMap<(u64, u64), PathBuf> = BTreeMap::new();

        let mut in_source = false;
        let mut source_path: Option<String> = None;
        let mut dst: Option<(u64, u64)> = None;
        let mut target = TextTarget::None;

        loop {
            match reader.read_event().map_err(malformed)? {
                Event::Start(element) => match element.name().as_ref() {
                    b"VRTDataset" => {
                        raster = Some((
                            required_int_attr(&element, "rasterXSize")?,
                            required_int_attr(&element, "rasterYSize")?,
                        ));
                    }
                    b"SRS" => target = TextTarget::Srs,
                    b"GeoTransform" => target = TextTarget::GeoTransform,
                    b"SimpleSource" => {
                        in_source = true;
                        source_path = None;
                        dst = None;
                    }
                    b"SourceFilename" if in_source => target = TextTarget::SourceFilename,
                    b"DstRect" if in_source => dst = dst_offsets(&element)?,
                    _ => {}
                },
                Event::Empty(element) => {
                    if element.name().as_ref() == b"DstRect" && in_source {
                        dst = dst_offsets(&element)?;
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(malformed)?;
                    let text = text.trim();
                    if !text.is_empty() {
                        match target {
                            TextTarget::Srs => srs = Some(text.to_string()),
                            TextTarget::GeoTransform => {
                                transform = Some(parse_geo_transform(text)?);
                            }
                            TextTarget::SourceFilename => source_path = Some(text.to_string()),
                            TextTarget::None => {}
                        }
                    }
                }
                Event::End(element) => match element.name().as_ref() {
                    b"SimpleSource" => {
                        if let (Some(path), Some(offsets)) = (source_path.take(), dst.take()) {
                            let path = PathBuf::from(path);
                            let resolved = if path.is_absolute() {
                                path
                            } else {
                                base_dir.join(path)
                            };
                            // keyed (y, x): last duplicate wins
                            placements.insert((offsets.1, offsets.0), resolved);
                        }
                        in_source = false;
                    }
                    b"SRS" | b"GeoTransform" | b"SourceFilename" => target = TextTarget::None,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let (raster_x, raster_y) =
            raster.ok_or_else(|| malformed("missing VRTDataset raster dimensions"))?;
        let srs = srs.ok_or_else(|| malformed("missing SRS element"))?;
        let crs_code = reduce_crs(&srs)
            .ok_or_else(|| malformed(format!("spatial reference not reducible to a CRS code: {srs}")))?;
        let (origin_e, px_x, origin_n, px_y) =
            transform.ok_or_else(|| malformed("missing GeoTransform element"))?;

        let pixel_size = px_x.abs();
        if pixel_size <= 0.0 || !pixel_size.is_finite() {
            return Err(malformed(format!("pixel size must be positive, got {px_x}")));
        }
        if (pixel_size - px_y.abs()).abs() > 1e-9 {
            log::warn!(
                "anisotropic pixel sizes |{px_x}| vs |{px_y}|, using |{px_x}|"
            );
        }

        let placements = placements
            .into_iter()
            .map(|((y_off, x_off), path)| Placement { path, x_off, y_off })
            .collect();

        Ok(Self {
            raster_x,
            raster_y,
            origin_e,
            origin_n,
            pixel_size,
            crs_code,
            placements,
        })
    }
}
