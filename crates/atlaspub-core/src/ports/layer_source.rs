//! Local layer source port (driven/secondary port)
//!
//! The layer source is the host application's view of its geospatial
//! layers. The exporter reads through it and never touches the host's
//! data model directly.
//!
//! ## Design Notes
//!
//! - Methods are blocking; the exporter calls them from a blocking task.
//! - Geometry is exchanged as GeoJSON geometry objects (`serde_json::Value`)
//!   so adapters do not need a shared geometry library.

use serde_json::{Map as JsonMap, Value};

use crate::domain::{Crs, GeometryType, LayerRef};

/// Native type of a local layer, as reported by the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    /// Features with geometry of the given class
    Vector(GeometryType),
    /// Attribute rows without geometry
    Table,
    /// Gridded raster data
    Raster,
    /// A layer type the service cannot ingest (mesh, point cloud, plugin layer, ...)
    Unsupported(String),
}

/// Identity and metadata of one local layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub layer_ref: LayerRef,
    pub name: String,
    pub kind: LayerKind,
    pub crs: Crs,
    /// Feature count if cheaply known (None for rasters or unknown)
    pub feature_count: Option<u64>,
    /// Approximate on-disk size in bytes, if known
    pub size_hint: Option<u64>,
}

/// A single vector or table feature
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Feature {
    /// GeoJSON geometry object, or None for attribute-only rows
    pub geometry: Option<Value>,
    /// Attribute values keyed by field name
    pub properties: JsonMap<String, Value>,
}

/// Iterator over a layer's features
pub type FeatureIter<'a> = Box<dyn Iterator<Item = anyhow::Result<Feature>> + Send + 'a>;

/// Port trait for reading local layers
pub trait LayerSource: Send + Sync {
    /// Returns metadata for the given layer
    ///
    /// # Errors
    /// Returns an error if the layer does not exist or cannot be inspected
    fn describe(&self, layer: &LayerRef) -> anyhow::Result<LayerDescriptor>;

    /// Returns the layer's approximate size without inspecting its contents
    ///
    /// Callers use this to reject oversized layers before [`describe`](Self::describe).
    /// Sources that cannot answer cheaply fall back to describing the layer.
    fn size_hint(&self, layer: &LayerRef) -> anyhow::Result<Option<u64>> {
        Ok(self.describe(layer)?.size_hint)
    }

    /// Iterates the features of a vector or table layer
    fn features(&self, layer: &LayerRef) -> anyhow::Result<FeatureIter<'_>>;

    /// Opens the raw raster bytes of a raster layer
    fn open_raster(&self, layer: &LayerRef) -> anyhow::Result<Box<dyn std::io::Read + Send>>;
}
