use std::{fs, path::Path};

use geo::{BoundingRect as _, CoordsIter as _, Geometry};
use wkt::TryFromWkt as _;

/// Bounding box in OGR envelope order: `(min_x, max_x, min_y, max_y)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Envelope {
    pub const fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        [
            (self.min_x, other.min_x),
            (self.max_x, other.max_x),
            (self.min_y, other.min_y),
            (self.max_y, other.max_y),
        ]
        .iter()
        .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

pub fn parse_wkt(wkt: &str) -> Result<Geometry<f64>, String> {
    Geometry::<f64>::try_from_wkt_str(wkt).map_err(|err| format!("invalid WKT: {err}"))
}

pub fn envelope_of(wkt: &str) -> Result<Envelope, String> {
    let rect = parse_wkt(wkt)?
        .bounding_rect()
        .ok_or_else(|| "geometry is empty".to_owned())?;
    Ok(Envelope::new(
        rect.min().x,
        rect.max().x,
        rect.min().y,
        rect.max().y,
    ))
}

fn geometry_type(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "POINT",
        Geometry::Line(_) => "LINE",
        Geometry::LineString(_) => "LINESTRING",
        Geometry::Polygon(_) => "POLYGON",
        Geometry::MultiPoint(_) => "MULTIPOINT",
        Geometry::MultiLineString(_) => "MULTILINESTRING",
        Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        Geometry::Rect(_) => "RECT",
        Geometry::Triangle(_) => "TRIANGLE",
    }
}

/// Same geometry type, same vertex count, every vertex within `tolerance`
/// on each axis.
pub fn check_geometry(actual_wkt: &str, expected_wkt: &str, tolerance: f64) -> Result<(), String> {
    let actual = parse_wkt(actual_wkt)?;
    let expected = parse_wkt(expected_wkt)?;

    if geometry_type(&actual) != geometry_type(&expected) {
        return Err(format!(
            "geometry type {} does not match expected {}",
            geometry_type(&actual),
            geometry_type(&expected)
        ));
    }
    let actual_count = actual.coords_count();
    let expected_count = expected.coords_count();
    if actual_count != expected_count {
        return Err(format!(
            "geometry has {actual_count} vertices, expected {expected_count}"
        ));
    }

    for (index, (a, e)) in actual.coords_iter().zip(expected.coords_iter()).enumerate() {
        let dx = (a.x - e.x).abs();
        let dy = (a.y - e.y).abs();
        if dx > tolerance || dy > tolerance {
            return Err(format!(
                "vertex {index} is ({}, {}), expected ({}, {}) within {tolerance}",
                a.x, a.y, e.x, e.y
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoldenPolicy {
    /// Compare against the stored image; a missing image is a failure.
    Compare,
    /// Write the image only when none is stored, otherwise compare.
    WriteMissing,
    /// Always overwrite the stored image.
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoldenOutcome {
    Matched,
    Written,
}

pub fn check_golden(
    actual: &[u8],
    golden_path: &Path,
    policy: GoldenPolicy,
) -> Result<GoldenOutcome, String> {
    let write = || {
        if let Some(parent) = golden_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("create {}: {err}", parent.display()))?;
        }
        fs::write(golden_path, actual)
            .map(|()| GoldenOutcome::Written)
            .map_err(|err| format!("write golden image {}: {err}", golden_path.display()))
    };

    match policy {
        GoldenPolicy::Refresh => return write(),
        GoldenPolicy::WriteMissing if !golden_path.exists() => return write(),
        GoldenPolicy::WriteMissing | GoldenPolicy::Compare => {}
    }

    let expected = fs::read(golden_path)
        .map_err(|err| format!("read golden image {}: {err}", golden_path.display()))?;
    if expected == actual {
        return Ok(GoldenOutcome::Matched);
    }
    Err(format!(
        "output differs from {}: {}",
        golden_path.display(),
        describe_image_difference(&expected, actual)
    ))
}

fn describe_image_difference(expected: &[u8], actual: &[u8]) -> String {
    let (Ok(expected_image), Ok(actual_image)) = (
        image::load_from_memory(expected),
        image::load_from_memory(actual),
    ) else {
        return format!(
            "{} bytes expected, {} bytes produced",
            expected.len(),
            actual.len()
        );
    };
    let expected_image = expected_image.to_rgba8();
    let actual_image = actual_image.to_rgba8();
    if expected_image.dimensions() != actual_image.dimensions() {
        let (ew, eh) = expected_image.dimensions();
        let (aw, ah) = actual_image.dimensions();
        return format!("expected {ew}x{eh} image, produced {aw}x{ah}");
    }

    let differing = expected_image
        .pixels()
        .zip(actual_image.pixels())
        .filter(|(e, a)| e != a)
        .count();
    let total = expected_image.pixels().len();
    if differing == 0 {
        "pixels match but encodings differ".to_owned()
    } else {
        format!("{differing} of {total} pixels differ")
    }
}
