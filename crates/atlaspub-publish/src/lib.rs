//! atlaspub-publish - Layer export and map publishing
//!
//! Turns local layers into uploadable packages and drives a publish run:
//!
//! - [`export::LayerExporter`]: format negotiation, size-limited
//!   serialization and checksumming of one layer
//! - [`source::GeoJsonDirectorySource`]: a [`LayerSource`] over a
//!   directory of GeoJSON and GeoTIFF files
//! - [`orchestrator::MapUploaderTask`]: export, upload and commit of a set
//!   of layers as one map, reported through `MultiStepFeedback`
//!
//! [`LayerSource`]: atlaspub_core::ports::LayerSource

pub mod export;
pub mod orchestrator;
pub mod source;

use atlaspub_api::{upload::UploadError, ApiError, AuthError};
use atlaspub_core::domain::DomainError;
use thiserror::Error;

use crate::export::ExportError;

/// Terminal error of a publish run
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Not logged in, or the session could not be refreshed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A REST call failed (including the final map commit)
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A layer could not be exported
    #[error(transparent)]
    Export(#[from] ExportError),

    /// A package could not be uploaded
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The run was cancelled before the commit point
    #[error("Publish cancelled")]
    Cancelled,

    /// A layer worker panicked or was aborted
    #[error("Publish worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl PublishError {
    /// Returns true if the caller should prompt for a new login
    pub fn requires_login(&self) -> bool {
        match self {
            PublishError::Auth(e) => matches!(e, AuthError::Expired),
            PublishError::Api(e) => e.requires_login(),
            PublishError::Upload(e) => e.requires_login(),
            _ => false,
        }
    }
}
