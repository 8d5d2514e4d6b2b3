//! Remote map and workspace projections
//!
//! Read-only mirrors of server resources. They are produced by the API
//! client from list/create responses and never mutated locally.

use serde::{Deserialize, Serialize};

use super::{
    newtypes::{Crs, MapId, PackageId, WorkspaceId},
    package::{GeometryType, PackageFormat},
};

/// A named container of maps under an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
}

/// A layer as published inside a remote map
///
/// Mirrors the metadata that was registered with the uploaded package so
/// callers can confirm what the service ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapLayer {
    pub name: String,
    #[serde(default)]
    pub package_id: Option<PackageId>,
    #[serde(default)]
    pub format: Option<PackageFormat>,
    #[serde(default)]
    pub crs: Option<Crs>,
    #[serde(default)]
    pub geometry_type: Option<GeometryType>,
    #[serde(default)]
    pub feature_count: Option<u64>,
}

/// A hosted map on the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map {
    pub id: MapId,
    pub title: String,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub layers: Vec<MapLayer>,
}

/// Where a publish run commits its layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapTarget {
    /// Create a new map with the given title
    New {
        title: String,
        workspace_id: Option<WorkspaceId>,
    },
    /// Append layers to an existing map
    Existing(MapId),
}

impl MapTarget {
    /// Workspace the uploads are scoped to, if known up front
    pub fn workspace_id(&self) -> Option<&WorkspaceId> {
        match self {
            MapTarget::New { workspace_id, .. } => workspace_id.as_ref(),
            MapTarget::Existing(_) => None,
        }
    }
}

impl std::fmt::Display for MapTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapTarget::New { title, .. } => write!(f, "new map \"{}\"", title),
            MapTarget::Existing(id) => write!(f, "map {}", id),
        }
    }
}
