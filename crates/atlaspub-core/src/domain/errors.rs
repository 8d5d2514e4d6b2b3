//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures and unknown progress steps.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A remote identifier (map, workspace, package) is malformed
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// A local layer reference is malformed
    #[error("Invalid layer reference: {0}")]
    InvalidLayerRef(String),

    /// A coordinate reference system string could not be understood
    #[error("Invalid CRS: {0}")]
    InvalidCrs(String),

    /// A feedback step name was not registered for the current run
    #[error("Unknown feedback step: {0}")]
    UnknownStep(String),

    /// Two feedback steps were registered under the same name
    #[error("Duplicate feedback step: {0}")]
    DuplicateStep(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}
