//! Directory-backed layer source
//!
//! Serves every `*.geojson` / `*.json` file in a directory as a vector (or
//! attribute table) layer and every `*.tif` / `*.tiff` file as a raster
//! layer. A layer's reference is its file name relative to the directory.
//!
//! The CRS is read from, in order: a sidecar `<stem>.crs` text file
//! (`EPSG:3857`), the legacy GeoJSON `crs` member, or EPSG:4326.
//!
//! Describing a layer only deserializes the document's shape (type, CRS
//! member, geometry types). Coordinates and properties are read once, by
//! [`LayerSource::features`].

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use atlaspub_core::{
    domain::{Crs, GeometryType, LayerRef},
    ports::{layer_source::FeatureIter, Feature, LayerDescriptor, LayerKind, LayerSource},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const VECTOR_EXTENSIONS: &[&str] = &["geojson", "json"];
const RASTER_EXTENSIONS: &[&str] = &["tif", "tiff"];

/// [`LayerSource`] over GeoJSON and GeoTIFF files in one directory
#[derive(Debug, Clone)]
pub struct GeoJsonDirectorySource {
    root: PathBuf,
}

impl GeoJsonDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists the publishable files in the directory, sorted by name
    pub fn list(&self) -> anyhow::Result<Vec<LayerRef>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read directory {}", self.root.display()))?;

        let mut layers = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let supported = extension(&path).is_some_and(|ext| {
                VECTOR_EXTENSIONS.contains(&ext.as_str()) || RASTER_EXTENSIONS.contains(&ext.as_str())
            });
            if !supported {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                layers.push(LayerRef::new(name)?);
            }
        }
        layers.sort();
        Ok(layers)
    }

    /// Maps a layer reference to a file inside the root
    fn resolve(&self, layer: &LayerRef) -> anyhow::Result<PathBuf> {
        let relative = Path::new(layer.as_str());
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("Layer reference must be a path inside {}: {layer}", self.root.display());
        }
        let path = self.root.join(relative);
        if !path.is_file() {
            bail!("Layer file not found: {}", path.display());
        }
        Ok(path)
    }

    fn read_features(&self, path: &Path) -> anyhow::Result<Vec<Feature>> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let document: Value = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Invalid GeoJSON in {}", path.display()))?;

        let features = match document_type(document.get("type").and_then(Value::as_str), path)? {
            DocumentType::FeatureCollection => document
                .get("features")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(to_feature).collect())
                .unwrap_or_default(),
            DocumentType::Feature => vec![to_feature(&document)],
        };
        Ok(features)
    }

    /// Reads a vector file's shape without materializing its features
    fn summarize(&self, path: &Path) -> anyhow::Result<(LayerKind, u64, Option<Crs>)> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let summary: DocumentSummary = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Invalid GeoJSON in {}", path.display()))?;

        let embedded_crs = summary
            .crs
            .and_then(|crs| crs.properties)
            .and_then(|properties| properties.name)
            .as_deref()
            .and_then(parse_crs_name);

        let (count, geometries): (u64, Vec<GeometrySummary>) =
            match document_type(summary.kind.as_deref(), path)? {
                DocumentType::FeatureCollection => (
                    summary.features.len() as u64,
                    summary
                        .features
                        .into_iter()
                        .filter_map(|feature| feature.geometry)
                        .collect(),
                ),
                DocumentType::Feature => (1, summary.geometry.into_iter().collect()),
            };
        let kind = classify(geometries.iter().map(|g| g.kind.as_str()));
        Ok((kind, count, embedded_crs))
    }

    fn sidecar_crs(&self, path: &Path) -> anyhow::Result<Option<Crs>> {
        let sidecar = path.with_extension("crs");
        if !sidecar.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&sidecar)
            .with_context(|| format!("Failed to read {}", sidecar.display()))?;
        let crs = Crs::new(text.trim())
            .with_context(|| format!("Invalid CRS in {}", sidecar.display()))?;
        Ok(Some(crs))
    }
}

impl LayerSource for GeoJsonDirectorySource {
    fn describe(&self, layer: &LayerRef) -> anyhow::Result<LayerDescriptor> {
        let path = self.resolve(layer)?;
        let size = fs::metadata(&path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(layer.as_str())
            .to_string();
        let sidecar = self.sidecar_crs(&path)?;

        let ext = extension(&path).unwrap_or_default();
        let descriptor = if VECTOR_EXTENSIONS.contains(&ext.as_str()) {
            let (kind, count, embedded_crs) = self.summarize(&path)?;
            LayerDescriptor {
                layer_ref: layer.clone(),
                name,
                kind,
                crs: sidecar.or(embedded_crs).unwrap_or_else(Crs::wgs84),
                feature_count: Some(count),
                size_hint: Some(size),
            }
        } else if RASTER_EXTENSIONS.contains(&ext.as_str()) {
            LayerDescriptor {
                layer_ref: layer.clone(),
                name,
                kind: LayerKind::Raster,
                crs: sidecar.unwrap_or_else(Crs::wgs84),
                feature_count: None,
                size_hint: Some(size),
            }
        } else {
            LayerDescriptor {
                layer_ref: layer.clone(),
                name,
                kind: LayerKind::Unsupported(format!("unsupported file type '.{ext}'")),
                crs: Crs::wgs84(),
                feature_count: None,
                size_hint: Some(size),
            }
        };

        debug!(layer = %layer, kind = ?descriptor.kind, crs = %descriptor.crs, "Described layer");
        Ok(descriptor)
    }

    fn size_hint(&self, layer: &LayerRef) -> anyhow::Result<Option<u64>> {
        let path = self.resolve(layer)?;
        let size = fs::metadata(&path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        Ok(Some(size))
    }

    fn features(&self, layer: &LayerRef) -> anyhow::Result<FeatureIter<'_>> {
        let path = self.resolve(layer)?;
        let features = self.read_features(&path)?;
        Ok(Box::new(features.into_iter().map(Ok::<_, anyhow::Error>)))
    }

    fn open_raster(&self, layer: &LayerRef) -> anyhow::Result<Box<dyn Read + Send>> {
        let path = self.resolve(layer)?;
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn to_feature(value: &Value) -> Feature {
    Feature {
        geometry: value.get("geometry").filter(|g| !g.is_null()).cloned(),
        properties: value
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

/// Top-level GeoJSON object types a layer file may hold
enum DocumentType {
    FeatureCollection,
    Feature,
}

fn document_type(kind: Option<&str>, path: &Path) -> anyhow::Result<DocumentType> {
    match kind {
        Some("FeatureCollection") => Ok(DocumentType::FeatureCollection),
        Some("Feature") => Ok(DocumentType::Feature),
        other => bail!(
            "Unsupported GeoJSON document type {:?} in {}",
            other.unwrap_or("<missing>"),
            path.display()
        ),
    }
}

// Shape of a GeoJSON document; unknown members such as coordinates and
// properties are skipped by the deserializer.

#[derive(Deserialize)]
struct DocumentSummary {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    features: Vec<FeatureSummary>,
    #[serde(default)]
    geometry: Option<GeometrySummary>,
    #[serde(default)]
    crs: Option<CrsSummary>,
}

#[derive(Deserialize)]
struct FeatureSummary {
    #[serde(default)]
    geometry: Option<GeometrySummary>,
}

#[derive(Deserialize)]
struct GeometrySummary {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
struct CrsSummary {
    #[serde(default)]
    properties: Option<CrsProperties>,
}

#[derive(Deserialize)]
struct CrsProperties {
    name: Option<String>,
}

/// Vector with the common geometry class, Mixed, or Table when no
/// feature has geometry
fn classify<'a>(geometry_types: impl IntoIterator<Item = &'a str>) -> LayerKind {
    let mut found: Option<GeometryType> = None;
    for geometry_type in geometry_types {
        let class = GeometryType::from_geojson_type(geometry_type).unwrap_or(GeometryType::Mixed);
        found = match found {
            None => Some(class),
            Some(previous) if previous == class => Some(previous),
            Some(_) => return LayerKind::Vector(GeometryType::Mixed),
        };
    }
    match found {
        Some(class) => LayerKind::Vector(class),
        None => LayerKind::Table,
    }
}

/// Accepts `EPSG:3857`, `urn:ogc:def:crs:EPSG::3857` and
/// `urn:ogc:def:crs:OGC:1.3:CRS84`
fn parse_crs_name(name: &str) -> Option<Crs> {
    if let Some(rest) = name.strip_prefix("urn:ogc:def:crs:") {
        let mut parts = rest.split(':');
        let authority = parts.next()?;
        let code = parts.last()?;
        return Crs::new(format!("{authority}:{code}")).ok();
    }
    Crs::new(name).ok()
}
