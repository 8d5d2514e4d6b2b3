//! Layer export
//!
//! Converts one local layer into a [`LayerPackage`]: the layer's native
//! kind is negotiated to a portable format, features are streamed through
//! a size-limited buffer, and the result is checksummed.
//!
//! | Layer kind        | Default format | Allowed hints            |
//! |-------------------|----------------|--------------------------|
//! | vector            | GeoJSON        | CSV (point layers only)  |
//! | table             | CSV            | GeoJSON                  |
//! | raster            | GeoTIFF        | -                        |
//! | unsupported       | -              | -                        |
//!
//! Export never touches the network and fails before producing any bytes
//! for unsupported layers. A layer that outgrows the configured maximum is
//! reported as [`ExportError::LayerTooLarge`] and its partial output is
//! dropped.

use std::io::{self, Read, Write};
use std::sync::Arc;

use atlaspub_core::{
    config::ExportConfig,
    domain::{Crs, GeometryType, LayerPackage, LayerRef, PackageFormat},
    ports::{Feature, LayerDescriptor, LayerKind, LayerSource},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Features written between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Errors that stop a layer export
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("Layer '{layer}' cannot be published: {reason}")]
    UnsupportedLayer { layer: String, reason: String },

    #[error("Layer '{layer}' exceeds the maximum package size of {limit} bytes")]
    LayerTooLarge { layer: String, limit: u64 },

    /// The layer source failed while describing or reading the layer
    #[error("Failed to read layer '{layer}': {message}")]
    Source { layer: String, message: String },

    #[error("Export cancelled")]
    Cancelled,
}

// ============================================================================
// Format negotiation
// ============================================================================

/// Picks the package format for a layer of the given kind
///
/// Returns the reason as `Err` when the layer (or the requested hint) is
/// not exportable.
pub fn negotiate_format(
    kind: &LayerKind,
    hint: Option<PackageFormat>,
) -> Result<PackageFormat, String> {
    match (kind, hint) {
        (LayerKind::Unsupported(reason), _) => Err(reason.clone()),
        (LayerKind::Vector(_), None | Some(PackageFormat::GeoJson)) => Ok(PackageFormat::GeoJson),
        (LayerKind::Vector(GeometryType::Point), Some(PackageFormat::Csv)) => Ok(PackageFormat::Csv),
        (LayerKind::Vector(geometry), Some(PackageFormat::Csv)) => Err(format!(
            "CSV export needs point geometry, layer has {geometry} geometry"
        )),
        (LayerKind::Table, None | Some(PackageFormat::Csv)) => Ok(PackageFormat::Csv),
        (LayerKind::Table, Some(PackageFormat::GeoJson)) => Ok(PackageFormat::GeoJson),
        (LayerKind::Raster, None | Some(PackageFormat::GeoTiff)) => Ok(PackageFormat::GeoTiff),
        (LayerKind::Raster, Some(format)) => {
            Err(format!("raster layers cannot be exported as {format}"))
        }
        (_, Some(format)) => Err(format!("layer cannot be exported as {format}")),
    }
}

// ============================================================================
// Size-limited buffer
// ============================================================================

/// In-memory sink that refuses to grow past `limit` bytes
struct LimitedBuffer {
    bytes: Vec<u8>,
    limit: u64,
    exceeded: bool,
}

impl LimitedBuffer {
    fn new(limit: u64) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            exceeded: false,
        }
    }
}

impl Write for LimitedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.bytes.len() as u64 + buf.len() as u64 > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "package size limit exceeded",
            ));
        }
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// LayerExporter
// ============================================================================

/// Exports layers from a [`LayerSource`] into uploadable packages
#[derive(Clone)]
pub struct LayerExporter {
    source: Arc<dyn LayerSource>,
    max_layer_bytes: u64,
}

impl LayerExporter {
    pub fn new(source: Arc<dyn LayerSource>, config: &ExportConfig) -> Self {
        Self {
            source,
            max_layer_bytes: config.max_layer_bytes,
        }
    }

    pub fn max_layer_bytes(&self) -> u64 {
        self.max_layer_bytes
    }

    pub fn source(&self) -> &Arc<dyn LayerSource> {
        &self.source
    }

    /// Checks that a layer can be exported without reading its data
    ///
    /// Used to reject unsupported and oversized layers before a run starts
    /// any network activity. The size gate runs before the source inspects
    /// the layer's contents.
    pub fn check(
        &self,
        layer: &LayerRef,
        hint: Option<PackageFormat>,
    ) -> Result<(LayerDescriptor, PackageFormat), ExportError> {
        let source_err = |e: anyhow::Error| ExportError::Source {
            layer: layer.to_string(),
            message: format!("{e:#}"),
        };
        let size = self.source.size_hint(layer).map_err(source_err)?;
        if size.is_some_and(|size| size > self.max_layer_bytes) {
            warn!(layer = %layer, size = ?size, limit = self.max_layer_bytes, "Layer too large");
            return Err(self.too_large(layer));
        }

        let descriptor = self.source.describe(layer).map_err(source_err)?;
        let format =
            negotiate_format(&descriptor.kind, hint).map_err(|reason| ExportError::UnsupportedLayer {
                layer: layer.to_string(),
                reason,
            })?;
        Ok((descriptor, format))
    }

    /// Exports a layer on the blocking thread pool
    pub async fn export(
        &self,
        layer: &LayerRef,
        hint: Option<PackageFormat>,
        cancel: &CancellationToken,
    ) -> Result<LayerPackage, ExportError> {
        let exporter = self.clone();
        let task_layer = layer.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || exporter.export_blocking(&task_layer, hint, &cancel))
            .await
            .map_err(|e| ExportError::Source {
                layer: layer.to_string(),
                message: format!("export task failed: {e}"),
            })?
    }

    /// Exports a layer that already passed [`check`](Self::check)
    ///
    /// The descriptor is reused as is, so the source only reads the layer's
    /// data once.
    pub async fn export_checked(
        &self,
        descriptor: LayerDescriptor,
        format: PackageFormat,
        cancel: &CancellationToken,
    ) -> Result<LayerPackage, ExportError> {
        let exporter = self.clone();
        let layer = descriptor.layer_ref.to_string();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || exporter.write_package(descriptor, format, &cancel))
            .await
            .map_err(|e| ExportError::Source {
                layer,
                message: format!("export task failed: {e}"),
            })?
    }

    /// Exports a layer on the current thread
    pub fn export_blocking(
        &self,
        layer: &LayerRef,
        hint: Option<PackageFormat>,
        cancel: &CancellationToken,
    ) -> Result<LayerPackage, ExportError> {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        let (descriptor, format) = self.check(layer, hint)?;
        self.write_package(descriptor, format, cancel)
    }

    fn write_package(
        &self,
        descriptor: LayerDescriptor,
        format: PackageFormat,
        cancel: &CancellationToken,
    ) -> Result<LayerPackage, ExportError> {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        let layer = &descriptor.layer_ref;

        debug!(layer = %layer, format = %format, kind = ?descriptor.kind, "Exporting layer");

        let mut buffer = LimitedBuffer::new(self.max_layer_bytes);
        let written = match format {
            PackageFormat::GeoJson => self.write_geojson(&descriptor, &mut buffer, cancel),
            PackageFormat::Csv => self.write_csv(&descriptor, &mut buffer, cancel),
            PackageFormat::GeoTiff => self.copy_raster(&descriptor, &mut buffer),
        };

        let feature_count = match written {
            Ok(count) => count,
            Err(_) if buffer.exceeded => {
                warn!(layer = %layer, limit = self.max_layer_bytes, "Layer too large");
                return Err(self.too_large(layer));
            }
            Err(e) => return Err(e),
        };

        let geometry_type = match &descriptor.kind {
            LayerKind::Vector(geometry) => *geometry,
            LayerKind::Raster => GeometryType::Raster,
            _ => GeometryType::NoGeometry,
        };
        let bytes = buffer.bytes;
        let checksum = STANDARD.encode(Sha256::digest(&bytes));

        info!(
            layer = %layer,
            format = %format,
            bytes = bytes.len(),
            features = ?feature_count,
            "Exported layer"
        );

        Ok(LayerPackage {
            source_layer_ref: layer.clone(),
            name: descriptor.name,
            format,
            byte_length: bytes.len() as u64,
            bytes,
            crs: descriptor.crs,
            geometry_type,
            feature_count,
            checksum,
        })
    }

    fn too_large(&self, layer: &LayerRef) -> ExportError {
        ExportError::LayerTooLarge {
            layer: layer.to_string(),
            limit: self.max_layer_bytes,
        }
    }

    fn source_error(layer: &LayerRef, error: impl std::fmt::Display) -> ExportError {
        ExportError::Source {
            layer: layer.to_string(),
            message: error.to_string(),
        }
    }

    /// Streams the layer's features as an RFC 7946 FeatureCollection
    fn write_geojson(
        &self,
        descriptor: &LayerDescriptor,
        out: &mut LimitedBuffer,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, ExportError> {
        let layer = &descriptor.layer_ref;
        let io_err = |e: io::Error| Self::source_error(layer, e);
        let features = self
            .source
            .features(layer)
            .map_err(|e| Self::source_error(layer, format!("{e:#}")))?;

        out.write_all(br#"{"type":"FeatureCollection""#).map_err(io_err)?;
        if !descriptor.crs.is_wgs84() {
            // Pre-RFC 7946 named CRS member for projected layers
            let crs = json!({"type": "name", "properties": {"name": crs_urn(&descriptor.crs)}});
            write!(out, r#","crs":{crs}"#).map_err(io_err)?;
        }
        out.write_all(br#","features":["#).map_err(io_err)?;

        let mut count: u64 = 0;
        for feature in features {
            let feature = feature.map_err(|e| Self::source_error(layer, format!("{e:#}")))?;
            if count % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            if count > 0 {
                out.write_all(b",").map_err(io_err)?;
            }
            let value = json!({
                "type": "Feature",
                "geometry": feature.geometry,
                "properties": feature.properties,
            });
            serde_json::to_writer(&mut *out, &value)
                .map_err(|e| Self::source_error(layer, e))?;
            count += 1;
        }

        out.write_all(b"]}").map_err(io_err)?;
        Ok(Some(count))
    }

    /// Writes attribute rows as CSV; point layers get leading `x`,`y` columns
    ///
    /// Columns come from the first feature's properties. Properties that
    /// only appear in later features are dropped.
    fn write_csv(
        &self,
        descriptor: &LayerDescriptor,
        out: &mut LimitedBuffer,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, ExportError> {
        let layer = &descriptor.layer_ref;
        let with_xy = matches!(descriptor.kind, LayerKind::Vector(GeometryType::Point));
        let mut features = self
            .source
            .features(layer)
            .map_err(|e| Self::source_error(layer, format!("{e:#}")))?
            .peekable();

        let columns: Vec<String> = match features.peek() {
            Some(Ok(first)) => first.properties.keys().cloned().collect(),
            _ => Vec::new(),
        };

        let mut writer = csv::Writer::from_writer(&mut *out);
        let mut header: Vec<&str> = Vec::new();
        if with_xy {
            header.extend(["x", "y"]);
        }
        header.extend(columns.iter().map(String::as_str));
        writer
            .write_record(&header)
            .map_err(|e| Self::source_error(layer, e))?;

        let mut count: u64 = 0;
        let mut dropped_columns = false;
        for feature in features {
            let feature = feature.map_err(|e| Self::source_error(layer, format!("{e:#}")))?;
            if count % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }

            let mut record = Vec::with_capacity(header.len());
            if with_xy {
                let (x, y) = point_xy(&feature).ok_or_else(|| ExportError::UnsupportedLayer {
                    layer: layer.to_string(),
                    reason: "CSV export needs single-point geometries".to_string(),
                })?;
                record.push(x.to_string());
                record.push(y.to_string());
            }
            record.extend(columns.iter().map(|c| csv_cell(feature.properties.get(c))));
            if !dropped_columns && feature.properties.keys().any(|k| !columns.contains(k)) {
                dropped_columns = true;
                warn!(layer = %layer, "Feature has properties missing from the CSV header; they are dropped");
            }

            writer
                .write_record(&record)
                .map_err(|e| Self::source_error(layer, e))?;
            count += 1;
        }

        writer.flush().map_err(|e| Self::source_error(layer, e))?;
        Ok(Some(count))
    }

    /// Copies raster bytes unchanged, reading at most one byte past the limit
    fn copy_raster(
        &self,
        descriptor: &LayerDescriptor,
        out: &mut LimitedBuffer,
    ) -> Result<Option<u64>, ExportError> {
        let layer = &descriptor.layer_ref;
        let reader = self
            .source
            .open_raster(layer)
            .map_err(|e| Self::source_error(layer, format!("{e:#}")))?;
        io::copy(&mut reader.take(self.max_layer_bytes + 1), out)
            .map_err(|e| Self::source_error(layer, e))?;
        Ok(None)
    }
}

impl std::fmt::Debug for LayerExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerExporter")
            .field("max_layer_bytes", &self.max_layer_bytes)
            .finish_non_exhaustive()
    }
}

/// `EPSG:3857` → `urn:ogc:def:crs:EPSG::3857`
fn crs_urn(crs: &Crs) -> String {
    match crs.as_str().split_once(':') {
        Some((authority, code)) => format!("urn:ogc:def:crs:{authority}::{code}"),
        None => crs.to_string(),
    }
}

fn point_xy(feature: &Feature) -> Option<(f64, f64)> {
    let geometry = feature.geometry.as_ref()?;
    if geometry.get("type")?.as_str()? != "Point" {
        return None;
    }
    let coordinates = geometry.get("coordinates")?.as_array()?;
    Some((coordinates.first()?.as_f64()?, coordinates.get(1)?.as_f64()?))
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
