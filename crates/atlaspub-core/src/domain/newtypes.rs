//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

/// Identifier for a single publish run (used for log correlation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid RunId: {e}")))
    }
}

// ============================================================================
// Remote service identifiers
// ============================================================================

/// Checks that a server-issued identifier is non-empty and URL-path safe.
fn validate_remote_id(kind: &str, id: &str) -> Result<(), DomainError> {
    if id.is_empty() {
        return Err(DomainError::InvalidRemoteId(format!(
            "{kind} cannot be empty"
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(DomainError::InvalidRemoteId(format!(
            "{kind} contains invalid characters: {id}"
        )));
    }

    Ok(())
}

/// Remote map identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MapId(String);

impl MapId {
    /// Create a new MapId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains characters that are
    /// not safe inside a URL path segment
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        validate_remote_id("Map ID", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MapId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MapId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MapId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<MapId> for String {
    fn from(id: MapId) -> Self {
        id.0
    }
}

/// Remote workspace identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Create a new WorkspaceId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains invalid characters
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        validate_remote_id("Workspace ID", &id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkspaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkspaceId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<WorkspaceId> for String {
    fn from(id: WorkspaceId) -> Self {
        id.0
    }
}

/// Identifier of an uploaded and registered layer package
///
/// Issued by the service when an upload is completed; referenced by the
/// final map assembly call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId(String);

impl PackageId {
    /// Create a new PackageId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains invalid characters
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        validate_remote_id("Package ID", &id)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PackageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PackageId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.0
    }
}

// ============================================================================
// Local layer reference
// ============================================================================

/// Reference to a layer held by the local layer source
///
/// Opaque to the core: the layer source decides what the string means
/// (a file stem, a project layer id, ...). Must be non-empty and free of
/// control characters so it can be used as a feedback step name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerRef(String);

impl LayerRef {
    /// Create a new LayerRef
    ///
    /// # Errors
    /// Returns error if the reference is empty or contains control characters
    pub fn new(reference: impl Into<String>) -> Result<Self, DomainError> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(DomainError::InvalidLayerRef(
                "Layer reference cannot be empty".to_string(),
            ));
        }
        if reference.chars().any(char::is_control) {
            return Err(DomainError::InvalidLayerRef(format!(
                "Layer reference contains control characters: {reference:?}"
            )));
        }
        Ok(Self(reference))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LayerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerRef {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LayerRef {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<LayerRef> for String {
    fn from(reference: LayerRef) -> Self {
        reference.0
    }
}

// ============================================================================
// Coordinate reference system
// ============================================================================

/// Coordinate reference system in `AUTHORITY:CODE` form (e.g. `EPSG:4326`)
///
/// The authority is normalized to upper case so `epsg:3857` and
/// `EPSG:3857` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs(String);

impl Crs {
    /// Create a new Crs from an `AUTHORITY:CODE` string
    ///
    /// # Errors
    /// Returns error if the string is not of the form `AUTHORITY:CODE`
    pub fn new(value: impl AsRef<str>) -> Result<Self, DomainError> {
        let value = value.as_ref().trim();
        let (authority, code) = value
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidCrs(format!("expected AUTHORITY:CODE, got {value:?}")))?;

        if authority.is_empty() || !authority.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::InvalidCrs(format!(
                "invalid authority in {value:?}"
            )));
        }
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::InvalidCrs(format!("invalid code in {value:?}")));
        }

        Ok(Self(format!("{}:{}", authority.to_ascii_uppercase(), code)))
    }

    /// WGS 84 geographic coordinates, the GeoJSON default
    #[must_use]
    pub fn wgs84() -> Self {
        Self("EPSG:4326".to_string())
    }

    /// Returns true if this is WGS 84 (`EPSG:4326` or `OGC:CRS84`)
    #[must_use]
    pub fn is_wgs84(&self) -> bool {
        self.0 == "EPSG:4326" || self.0 == "OGC:CRS84"
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Crs {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Crs {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Crs {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.0
    }
}
