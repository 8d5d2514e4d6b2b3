//! Layer packages and upload parameters
//!
//! A [`LayerPackage`] is the portable serialization of one local layer,
//! produced by the exporter and consumed exactly once by the uploader.
//! [`UploadParameters`] are the short-lived, pre-signed storage target
//! issued by the service for a single package.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Crs, LayerRef};

// ============================================================================
// PackageFormat
// ============================================================================

/// Portable formats the service ingests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageFormat {
    /// RFC 7946 FeatureCollection (vector layers)
    #[serde(rename = "geojson")]
    GeoJson,
    /// Comma-separated attribute table (no geometry, or point x/y columns)
    Csv,
    /// GeoTIFF raster, passed through unchanged
    #[serde(rename = "geotiff")]
    GeoTiff,
}

impl PackageFormat {
    /// File extension used for the uploaded object name
    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::GeoJson => "geojson",
            PackageFormat::Csv => "csv",
            PackageFormat::GeoTiff => "tif",
        }
    }

    /// MIME type sent with the storage upload
    pub fn content_type(&self) -> &'static str {
        match self {
            PackageFormat::GeoJson => "application/geo+json",
            PackageFormat::Csv => "text/csv",
            PackageFormat::GeoTiff => "image/tiff",
        }
    }
}

impl std::fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageFormat::GeoJson => write!(f, "geojson"),
            PackageFormat::Csv => write!(f, "csv"),
            PackageFormat::GeoTiff => write!(f, "geotiff"),
        }
    }
}

impl std::str::FromStr for PackageFormat {
    type Err = super::errors::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geojson" | "json" => Ok(PackageFormat::GeoJson),
            "csv" => Ok(PackageFormat::Csv),
            "geotiff" | "tif" | "tiff" => Ok(PackageFormat::GeoTiff),
            other => Err(super::errors::DomainError::ValidationFailed(format!(
                "unknown package format '{other}'"
            ))),
        }
    }
}

// ============================================================================
// GeometryType
// ============================================================================

/// Geometry class of a layer's features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryType {
    Point,
    Line,
    Polygon,
    /// Vector layer whose features mix geometry classes
    Mixed,
    /// Attribute-only table
    #[serde(rename = "none")]
    NoGeometry,
    Raster,
}

impl GeometryType {
    /// Classifies a GeoJSON geometry `type` member
    pub fn from_geojson_type(kind: &str) -> Option<Self> {
        match kind {
            "Point" | "MultiPoint" => Some(GeometryType::Point),
            "LineString" | "MultiLineString" => Some(GeometryType::Line),
            "Polygon" | "MultiPolygon" => Some(GeometryType::Polygon),
            "GeometryCollection" => Some(GeometryType::Mixed),
            _ => None,
        }
    }
}

impl std::fmt::Display for GeometryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GeometryType::Point => "point",
            GeometryType::Line => "line",
            GeometryType::Polygon => "polygon",
            GeometryType::Mixed => "mixed",
            GeometryType::NoGeometry => "none",
            GeometryType::Raster => "raster",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// LayerPackage
// ============================================================================

/// An exported layer ready for upload
///
/// Owned by the worker processing the layer and dropped as soon as the
/// upload completes or fails; packages are never cached.
#[derive(Clone, PartialEq, Eq)]
pub struct LayerPackage {
    /// The local layer this package was produced from
    pub source_layer_ref: LayerRef,
    /// Human-readable layer name (used as the uploaded file stem)
    pub name: String,
    pub format: PackageFormat,
    pub bytes: Vec<u8>,
    pub byte_length: u64,
    pub crs: Crs,
    pub geometry_type: GeometryType,
    /// Number of features (None for rasters)
    pub feature_count: Option<u64>,
    /// Base64-encoded SHA-256 of `bytes`
    pub checksum: String,
}

impl LayerPackage {
    /// Object name used when requesting upload parameters
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.format.extension())
    }
}

impl std::fmt::Debug for LayerPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerPackage")
            .field("source_layer_ref", &self.source_layer_ref)
            .field("name", &self.name)
            .field("format", &self.format)
            .field("byte_length", &self.byte_length)
            .field("crs", &self.crs)
            .field("geometry_type", &self.geometry_type)
            .field("feature_count", &self.feature_count)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// UploadParameters
// ============================================================================

/// One contiguous byte range of a multi-part upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part number
    pub number: u32,
    /// Byte offset of the part within the package
    pub offset: u64,
    /// Length of the part in bytes
    pub len: u64,
}

impl PartRange {
    /// Inclusive end offset, as used in `Content-Range`
    pub fn end_inclusive(&self) -> u64 {
        (self.offset + self.len).saturating_sub(1)
    }
}

/// Pre-signed storage target for one package
///
/// Fetched immediately before use and never reused across packages or
/// after `expires_at`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct UploadParameters {
    pub upload_url: String,
    #[serde(default = "default_upload_method")]
    pub method: String,
    #[serde(default, rename = "headers")]
    pub required_headers: BTreeMap<String, String>,
    /// Present when the target expects a multi-part upload
    #[serde(default)]
    pub part_size: Option<u64>,
    pub completion_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_upload_method() -> String {
    "PUT".to_string()
}

impl UploadParameters {
    /// Returns true if the server-declared TTL has passed
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Splits `total` bytes into the parts this target expects
    ///
    /// Returns a single part covering everything when no `part_size` is set
    /// (or it is zero). An empty package still yields one zero-length part.
    pub fn parts(&self, total: u64) -> Vec<PartRange> {
        let part_size = match self.part_size {
            Some(size) if size > 0 && size < total => size,
            _ => {
                return vec![PartRange {
                    number: 1,
                    offset: 0,
                    len: total,
                }]
            }
        };

        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut number = 1u32;
        while offset < total {
            let len = part_size.min(total - offset);
            parts.push(PartRange {
                number,
                offset,
                len,
            });
            offset += len;
            number += 1;
        }
        parts
    }

    /// Upload URL without its query string (safe to log)
    pub fn redacted_url(&self) -> &str {
        self.upload_url
            .split_once('?')
            .map(|(base, _)| base)
            .unwrap_or(&self.upload_url)
    }
}

impl std::fmt::Debug for UploadParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadParameters")
            .field("upload_url", &self.redacted_url())
            .field("method", &self.method)
            .field("part_size", &self.part_size)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
