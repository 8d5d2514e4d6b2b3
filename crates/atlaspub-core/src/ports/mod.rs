//! Port definitions (ports-and-adapters interfaces)
//!
//! Ports are the interfaces that the publishing core depends on, but whose
//! implementations live in adapter crates or in the embedding application.
//!
//! ## Ports Overview
//!
//! - [`TokenStorage`] - Persistent, erasable storage for [`Credentials`](crate::domain::Credentials)
//! - [`LayerSource`] - Read-only provider of local layer identity, features and rasters

pub mod layer_source;
pub mod token_storage;

pub use layer_source::{Feature, LayerDescriptor, LayerKind, LayerSource};
pub use token_storage::TokenStorage;
