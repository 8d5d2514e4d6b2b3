//! Package upload through pre-signed storage targets
//!
//! Uploading one [`LayerPackage`] is a three-step exchange:
//!
//! 1. `POST /uploads` with the package metadata returns fresh
//!    [`UploadParameters`] (a pre-signed URL, optional part size, and a
//!    completion token).
//! 2. The bytes are PUT to storage, either in one request or as numbered
//!    parts (`Content-Range: bytes a-b/total`, `x-part-number: n`), up to
//!    `part_parallelism` parts at a time. Storage acknowledges each part
//!    with an ETag.
//! 3. `POST /uploads/complete` with the completion token and part ETags
//!    registers the package and returns its [`PackageId`].
//!
//! ## Failure handling
//!
//! - Any part failure restarts the whole package with new parameters (no
//!   partial-part resume), up to `max_attempts` times.
//! - Expired parameters (detected before a part starts, from storage, or
//!   from the `upload_expired` server code at completion) are re-fetched
//!   and the package restarted at most `expired_restarts` times.
//! - Cancellation is checked before fetching parameters, before each part,
//!   and before completion. Once completion has been sent it is not
//!   cancelled.
//! - Completion is called at most once per successful transfer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atlaspub_core::{
    config::UploadConfig,
    domain::{LayerPackage, PackageId, PartRange, UploadParameters, WorkspaceId},
};
use futures_util::{stream, StreamExt};
use reqwest::{header::CONTENT_TYPE, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{client::ApiGateway, ApiError};

/// Server error code meaning the completion token is no longer valid
pub const UPLOAD_EXPIRED_CODE: &str = "upload_expired";

/// Progress callback: `(bytes_acknowledged, total_bytes)`
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

// ============================================================================
// Errors and results
// ============================================================================

/// Errors that end a package upload
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Transient storage failures outlasted the whole-package retries
    #[error("Upload failed after {attempts} attempts: {message}")]
    Failed { attempts: u32, message: String },

    /// Upload parameters kept expiring after the allowed restarts
    #[error("Upload parameters expired")]
    ParameterExpired,

    /// The run was cancelled at a checkpoint
    #[error("Upload cancelled")]
    Cancelled,

    /// A REST call (parameters or completion) failed
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl UploadError {
    pub fn requires_login(&self) -> bool {
        matches!(self, UploadError::Api(e) if e.requires_login())
    }
}

/// A package registered with the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPackage {
    pub package_id: PackageId,
    /// Number of storage parts in the successful transfer
    pub parts: u32,
    /// Transfers started, including the successful one
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct PartAck {
    part_number: u32,
    etag: String,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    package_id: PackageId,
}

/// Why a transfer stopped
#[derive(Debug)]
enum TransferFailure {
    Cancelled,
    Expired,
    Failed(String),
}

// ============================================================================
// UploadCoordinator
// ============================================================================

/// Uploads exported packages and registers them with the service
pub struct UploadCoordinator {
    gateway: Arc<ApiGateway>,
    max_attempts: u32,
    part_parallelism: usize,
    expired_restarts: u32,
}

impl UploadCoordinator {
    pub fn new(gateway: Arc<ApiGateway>, config: &UploadConfig) -> Self {
        Self {
            gateway,
            max_attempts: config.max_attempts.max(1),
            part_parallelism: config.part_parallelism.max(1),
            expired_restarts: config.expired_restarts,
        }
    }

    /// Uploads `package` and returns its registered id
    ///
    /// `workspace_id` scopes the upload when the target workspace is known.
    pub async fn upload(
        &self,
        package: &LayerPackage,
        workspace_id: Option<&WorkspaceId>,
        cancel: &CancellationToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<UploadedPackage, UploadError> {
        let mut attempts: u32 = 0;
        let mut failures: u32 = 0;
        let mut expired: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            attempts += 1;

            let params = self.request_parameters(package, workspace_id).await?;
            debug!(
                layer = %package.source_layer_ref,
                target = params.redacted_url(),
                part_size = ?params.part_size,
                attempt = attempts,
                "Received upload parameters"
            );

            let outcome = if params.is_expired() {
                Err(TransferFailure::Expired)
            } else {
                self.transfer(package, &params, cancel, progress).await
            };

            let failure = match outcome {
                Ok(acks) => {
                    if cancel.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }
                    let parts = acks.len() as u32;
                    match self.complete(&params, acks).await {
                        Ok(package_id) => {
                            info!(
                                layer = %package.source_layer_ref,
                                package = %package_id,
                                bytes = package.byte_length,
                                parts,
                                attempts,
                                "Package uploaded"
                            );
                            return Ok(UploadedPackage {
                                package_id,
                                parts,
                                attempts,
                            });
                        }
                        Err(e) if e.server_code() == Some(UPLOAD_EXPIRED_CODE) => {
                            TransferFailure::Expired
                        }
                        Err(e) => return Err(UploadError::Api(e)),
                    }
                }
                Err(failure) => failure,
            };

            match failure {
                TransferFailure::Cancelled => return Err(UploadError::Cancelled),
                TransferFailure::Expired => {
                    if expired >= self.expired_restarts {
                        warn!(layer = %package.source_layer_ref, "Upload parameters expired again, giving up");
                        return Err(UploadError::ParameterExpired);
                    }
                    expired += 1;
                    warn!(layer = %package.source_layer_ref, "Upload parameters expired, restarting with fresh parameters");
                }
                TransferFailure::Failed(message) => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        warn!(layer = %package.source_layer_ref, attempts, error = %message, "Upload failed");
                        return Err(UploadError::Failed { attempts, message });
                    }
                    warn!(layer = %package.source_layer_ref, attempt = attempts, error = %message, "Part failed, restarting package upload");
                }
            }
        }
    }

    /// `POST /uploads`
    async fn request_parameters(
        &self,
        package: &LayerPackage,
        workspace_id: Option<&WorkspaceId>,
    ) -> Result<UploadParameters, ApiError> {
        let body = json!({
            "file_name": package.file_name(),
            "format": package.format,
            "byte_length": package.byte_length,
            "checksum": package.checksum,
            "crs": package.crs,
            "geometry_type": package.geometry_type,
            "feature_count": package.feature_count,
            "workspace_id": workspace_id,
        });
        self.gateway
            .call_json(Method::POST, "/uploads", Some(&body), &[])
            .await
    }

    /// `POST /uploads/complete`, keyed by the completion token
    async fn complete(
        &self,
        params: &UploadParameters,
        acks: Vec<PartAck>,
    ) -> Result<PackageId, ApiError> {
        let body = json!({
            "completion_token": params.completion_token,
            "parts": acks,
        });
        let response: CompleteResponse = self
            .gateway
            .post_idempotent("/uploads/complete", &body, &params.completion_token)
            .await?;
        Ok(response.package_id)
    }

    /// PUTs every part; stops at the first failure
    async fn transfer(
        &self,
        package: &LayerPackage,
        params: &UploadParameters,
        cancel: &CancellationToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<PartAck>, TransferFailure> {
        let method = Method::from_bytes(params.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransferFailure::Failed(format!("unsupported upload method {}", params.method)))?;
        let total = package.bytes.len() as u64;
        let parts = params.parts(total);
        let multipart = parts.len() > 1;
        let acknowledged = AtomicU64::new(0);

        let mut in_flight = stream::iter(parts.into_iter().map(|part| {
            let method = method.clone();
            let acknowledged = &acknowledged;
            async move {
                let ack = self
                    .put_part(package, params, method, part, multipart, cancel)
                    .await?;
                let done = acknowledged.fetch_add(part.len, Ordering::SeqCst) + part.len;
                if let Some(report) = progress {
                    report(done, total);
                }
                Ok::<_, TransferFailure>(ack)
            }
        }))
        .buffer_unordered(self.part_parallelism);

        let mut acks = Vec::new();
        while let Some(result) = in_flight.next().await {
            // Dropping the stream on error abandons the parts still in flight.
            acks.push(result?);
        }
        acks.sort_by_key(|ack| ack.part_number);
        Ok(acks)
    }

    async fn put_part(
        &self,
        package: &LayerPackage,
        params: &UploadParameters,
        method: Method,
        part: PartRange,
        multipart: bool,
        cancel: &CancellationToken,
    ) -> Result<PartAck, TransferFailure> {
        if cancel.is_cancelled() {
            return Err(TransferFailure::Cancelled);
        }
        if params.is_expired() {
            return Err(TransferFailure::Expired);
        }

        let start = part.offset as usize;
        let end = (part.offset + part.len) as usize;
        let data = package.bytes[start..end].to_vec();

        let mut request = self
            .gateway
            .http_client()
            .request(method, &params.upload_url)
            .header(CONTENT_TYPE, package.format.content_type());
        for (name, value) in &params.required_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if multipart {
            request = request
                .header(
                    "Content-Range",
                    format!(
                        "bytes {}-{}/{}",
                        part.offset,
                        part.end_inclusive(),
                        package.bytes.len()
                    ),
                )
                .header("x-part-number", part.number.to_string());
        }

        debug!(
            target_url = params.redacted_url(),
            part = part.number,
            bytes = part.len,
            "Uploading part"
        );

        let response = request
            .body(data)
            .send()
            .await
            .map_err(|e| TransferFailure::Failed(format!("part {}: {e}", part.number)))?;

        let status = response.status();
        if status.is_success() {
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string())
                .unwrap_or_default();
            return Ok(PartAck {
                part_number: part.number,
                etag,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::FORBIDDEN && body.to_ascii_lowercase().contains("expired") {
            return Err(TransferFailure::Expired);
        }
        Err(TransferFailure::Failed(format!(
            "part {} rejected by storage with HTTP {}",
            part.number,
            status.as_u16()
        )))
    }
}

impl std::fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("max_attempts", &self.max_attempts)
            .field("part_parallelism", &self.part_parallelism)
            .field("expired_restarts", &self.expired_restarts)
            .finish()
    }
}
