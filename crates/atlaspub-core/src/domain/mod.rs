//! Domain entities
//!
//! This module contains the core domain types for atlaspub:
//! - Newtypes for type-safe identifiers and validated domain values
//! - Credentials and user identity
//! - Remote map and workspace projections
//! - Layer packages and pre-signed upload parameters
//! - Domain-specific error types

pub mod credentials;
pub mod errors;
pub mod map;
pub mod newtypes;
pub mod package;

// Re-export commonly used types
pub use credentials::{Credentials, User};
pub use errors::DomainError;
pub use map::{Map, MapLayer, MapTarget, Workspace};
pub use newtypes::*;
pub use package::{GeometryType, LayerPackage, PackageFormat, PartRange, UploadParameters};
