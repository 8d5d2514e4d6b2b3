//! Publish run orchestration
//!
//! [`MapUploaderTask`] drives one publish run from layer references to a
//! committed map:
//!
//! ```text
//! ensure token ──► register steps ──► preflight (size + describe + negotiate)
//!                                          │
//!                   ┌──────────────────────┘
//!                   ▼
//!   worker pool (Semaphore, JoinSet)
//!     layer:<ref>  export ─► upload ─► package id
//!                   │
//!                   ▼  all layers succeeded
//!   finalize: POST /maps or POST /maps/{id}/layers   (single commit point)
//! ```
//!
//! The first failing layer fails its step, which cancels the other steps
//! and trips the run's cancellation token; workers stop at their next
//! checkpoint and the run returns that first error without committing.

use std::collections::HashMap;
use std::sync::Arc;

use atlaspub_api::{
    client::ApiGateway,
    upload::{UploadCoordinator, UploadError},
};
use atlaspub_core::{
    config::Config,
    domain::{LayerRef, Map, MapTarget, PackageFormat, PackageId, RunId, WorkspaceId},
    feedback::MultiStepFeedback,
    ports::{LayerDescriptor, LayerSource},
};
use tokio::{
    sync::Semaphore,
    task::{self, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    export::{ExportError, LayerExporter},
    PublishError,
};

/// Name of the commit step
pub const FINALIZE_STEP: &str = "finalize";

/// Share of a layer step's progress attributed to export
const EXPORT_SHARE: f64 = 0.2;

const LAYER_STEP_WEIGHT: f64 = 1.0;
const FINALIZE_STEP_WEIGHT: f64 = 0.25;

/// What a layer worker task returns: its request index and outcome
type WorkerOutcome = (usize, Result<PackageId, PublishError>);

/// Feedback step name for a layer
pub fn layer_step(layer: &LayerRef) -> String {
    format!("layer:{layer}")
}

// ============================================================================
// Request
// ============================================================================

/// One layer to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRequest {
    pub layer: LayerRef,
    /// Preferred package format; `None` uses the layer's default
    pub format_hint: Option<PackageFormat>,
}

impl From<LayerRef> for LayerRequest {
    fn from(layer: LayerRef) -> Self {
        Self {
            layer,
            format_hint: None,
        }
    }
}

/// Input of a publish run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub target: MapTarget,
    pub layers: Vec<LayerRequest>,
}

impl PublishRequest {
    pub fn new(target: MapTarget, layers: impl IntoIterator<Item = LayerRef>) -> Self {
        Self {
            target,
            layers: layers.into_iter().map(LayerRequest::from).collect(),
        }
    }

    /// Sets the format hint for every layer
    pub fn with_format_hint(mut self, hint: Option<PackageFormat>) -> Self {
        for layer in &mut self.layers {
            layer.format_hint = hint;
        }
        self
    }
}

// ============================================================================
// MapUploaderTask
// ============================================================================

/// Background job publishing a set of layers as one map
///
/// One task drives one run. Progress, cancellation and the first failure
/// are observable through [`feedback`](Self::feedback) while
/// [`run`](Self::run) is in progress.
pub struct MapUploaderTask {
    run_id: RunId,
    gateway: Arc<ApiGateway>,
    exporter: LayerExporter,
    uploader: Arc<UploadCoordinator>,
    feedback: Arc<MultiStepFeedback>,
    concurrency: usize,
}

impl MapUploaderTask {
    pub fn new(config: &Config, gateway: Arc<ApiGateway>, source: Arc<dyn LayerSource>) -> Self {
        let uploader = Arc::new(UploadCoordinator::new(Arc::clone(&gateway), &config.upload));
        Self {
            run_id: RunId::new(),
            gateway,
            exporter: LayerExporter::new(source, &config.export),
            uploader,
            feedback: Arc::new(MultiStepFeedback::new()),
            concurrency: config.publish.effective_concurrency(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Progress and state of the run
    pub fn feedback(&self) -> &Arc<MultiStepFeedback> {
        &self.feedback
    }

    /// Requests cancellation; ignored once the map commit has started
    pub fn cancel(&self) {
        self.feedback.cancel();
    }

    /// Executes the run and returns the created or updated map
    ///
    /// # Errors
    /// - `Auth` when no valid session exists (no steps are registered)
    /// - `Domain` for an empty or duplicated layer list
    /// - the first layer's `Export` or `Upload` error
    /// - `Cancelled` when cancelled before the commit point
    /// - `Api` when the commit call fails
    pub async fn run(&self, request: PublishRequest) -> Result<Map, PublishError> {
        let PublishRequest { target, layers } = request;
        let steps: Vec<String> = layers.iter().map(|l| layer_step(&l.layer)).collect();

        if self.feedback.is_cancelled() {
            self.register_steps(&steps)?;
            info!(run = %self.run_id, "Publish run cancelled before start");
            return Err(PublishError::Cancelled);
        }

        if let Err(e) = self.gateway.auth().ensure_valid_token().await {
            warn!(run = %self.run_id, error = %e, "Publish run needs a valid session");
            return Err(e.into());
        }

        if layers.is_empty() {
            return Err(atlaspub_core::domain::DomainError::ValidationFailed(
                "no layers to publish".to_string(),
            )
            .into());
        }
        self.register_steps(&steps)?;

        info!(
            run = %self.run_id,
            target = %target,
            layers = layers.len(),
            concurrency = self.concurrency,
            "Publish run started"
        );

        let checked = self.preflight(&layers).await?;
        let package_ids = self.upload_layers(checked, target.workspace_id()).await?;
        self.commit(&target, &package_ids).await
    }

    fn register_steps(&self, steps: &[String]) -> Result<(), PublishError> {
        let entries = steps
            .iter()
            .map(|name| (name.clone(), LAYER_STEP_WEIGHT))
            .chain(std::iter::once((FINALIZE_STEP.to_string(), FINALIZE_STEP_WEIGHT)));
        self.feedback.begin(entries)?;
        Ok(())
    }

    /// Rejects unsupported and oversized layers before any upload starts
    ///
    /// Returns each layer's descriptor and negotiated format in request
    /// order, so workers do not inspect the layer again.
    async fn preflight(&self, layers: &[LayerRequest]) -> Result<Vec<CheckedLayer>, PublishError> {
        let exporter = self.exporter.clone();
        let requests = layers.to_vec();
        let checked = tokio::task::spawn_blocking(move || {
            requests
                .into_iter()
                .map(|request| {
                    exporter
                        .check(&request.layer, request.format_hint)
                        .map(|(descriptor, format)| CheckedLayer { descriptor, format })
                        .map_err(|e| (request.layer, e))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| PublishError::Worker(e.to_string()))?;

        checked.map_err(|(layer, e)| {
            self.record_failure(&layer_step(&layer), &e);
            e.into()
        })
    }

    /// Exports and uploads every layer on the bounded worker pool
    ///
    /// Returns the package ids in request order.
    async fn upload_layers(
        &self,
        layers: Vec<CheckedLayer>,
        workspace_id: Option<&WorkspaceId>,
    ) -> Result<Vec<PackageId>, PublishError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let cancel = self.feedback.cancellation_token();
        let layer_count = layers.len();
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut steps_by_task = HashMap::with_capacity(layer_count);

        for (index, layer) in layers.into_iter().enumerate() {
            let step = layer_step(&layer.descriptor.layer_ref);
            let worker = LayerWorker {
                run_id: self.run_id,
                step: step.clone(),
                layer,
                workspace_id: workspace_id.cloned(),
                exporter: self.exporter.clone(),
                uploader: Arc::clone(&self.uploader),
                feedback: Arc::clone(&self.feedback),
                cancel: cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let handle = workers.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => worker.run().await,
                    Err(_) => Err(PublishError::Cancelled),
                };
                (index, result)
            });
            steps_by_task.insert(handle.id(), step);
        }

        self.join_workers(workers, steps_by_task, layer_count).await
    }

    /// Collects worker outcomes, failing the owning layer step on error
    ///
    /// A worker that panics or is aborted fails the step it was spawned for.
    async fn join_workers(
        &self,
        mut workers: JoinSet<WorkerOutcome>,
        mut steps_by_task: HashMap<task::Id, String>,
        layer_count: usize,
    ) -> Result<Vec<PackageId>, PublishError> {
        let mut package_ids: Vec<Option<PackageId>> = vec![None; layer_count];
        let mut first_error: Option<PublishError> = None;

        while let Some(joined) = workers.join_next_with_id().await {
            let (task_id, outcome) = match joined {
                Ok((task_id, (index, result))) => (task_id, Ok((index, result))),
                Err(join_error) => (join_error.id(), Err(join_error)),
            };
            let step = steps_by_task.remove(&task_id).unwrap_or_else(|| FINALIZE_STEP.to_string());
            match outcome {
                Ok((index, Ok(package_id))) => {
                    if let Err(e) = self.feedback.complete_step(&step) {
                        debug!(step, error = %e, "Could not complete step");
                    }
                    package_ids[index] = Some(package_id);
                }
                Ok((_, Err(PublishError::Cancelled))) => {}
                Ok((_, Err(e))) => {
                    self.record_failure(&step, &e);
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(run = %self.run_id, step, error = %join_error, "Layer worker failed");
                    let e = PublishError::Worker(join_error.to_string());
                    self.record_failure(&step, &e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            warn!(run = %self.run_id, error = %e, "Publish run failed");
            return Err(e);
        }
        if self.feedback.is_cancelled() {
            info!(run = %self.run_id, "Publish run cancelled");
            return Err(PublishError::Cancelled);
        }

        package_ids
            .into_iter()
            .map(|id| id.ok_or(PublishError::Cancelled))
            .collect()
    }

    /// The single commit point
    async fn commit(&self, target: &MapTarget, package_ids: &[PackageId]) -> Result<Map, PublishError> {
        if !self.feedback.enter_commit() {
            info!(run = %self.run_id, "Publish run cancelled before commit");
            return Err(PublishError::Cancelled);
        }
        self.feedback.start_step(FINALIZE_STEP)?;

        let commit_key = self.run_id.to_string();
        let result = match target {
            MapTarget::New {
                title,
                workspace_id,
            } => {
                self.gateway
                    .create_map(title, workspace_id.as_ref(), package_ids, &commit_key)
                    .await
            }
            MapTarget::Existing(map_id) => {
                self.gateway
                    .append_layers(map_id, package_ids, &commit_key)
                    .await
            }
        };

        match result {
            Ok(map) => {
                self.feedback.complete_step(FINALIZE_STEP)?;
                info!(run = %self.run_id, map = %map.id, layers = package_ids.len(), "Publish run finished");
                Ok(map)
            }
            Err(e) => {
                self.record_failure(FINALIZE_STEP, &e);
                error!(run = %self.run_id, error = %e, "Map commit failed");
                Err(e.into())
            }
        }
    }

    fn record_failure(&self, step: &str, error: &dyn std::fmt::Display) {
        if let Err(e) = self.feedback.fail_step(step, error) {
            debug!(step, error = %e, "Could not record step failure");
        }
    }
}

impl std::fmt::Debug for MapUploaderTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapUploaderTask")
            .field("run_id", &self.run_id)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// LayerWorker
// ============================================================================

/// A layer that passed preflight
struct CheckedLayer {
    descriptor: LayerDescriptor,
    format: PackageFormat,
}

/// Export-then-upload unit for one layer
struct LayerWorker {
    run_id: RunId,
    step: String,
    layer: CheckedLayer,
    workspace_id: Option<WorkspaceId>,
    exporter: LayerExporter,
    uploader: Arc<UploadCoordinator>,
    feedback: Arc<MultiStepFeedback>,
    cancel: CancellationToken,
}

impl LayerWorker {
    async fn run(&self) -> Result<PackageId, PublishError> {
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        let layer = &self.layer.descriptor.layer_ref;
        self.feedback.start_step(&self.step)?;
        debug!(run = %self.run_id, layer = %layer, "Layer worker started");

        let package = match self
            .exporter
            .export_checked(self.layer.descriptor.clone(), self.layer.format, &self.cancel)
            .await
        {
            Ok(package) => package,
            Err(ExportError::Cancelled) => return Err(PublishError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        self.progress(EXPORT_SHARE);

        let report = |done: u64, total: u64| {
            let fraction = if total == 0 {
                1.0
            } else {
                done as f64 / total as f64
            };
            self.progress(EXPORT_SHARE + (1.0 - EXPORT_SHARE) * fraction);
        };

        let uploaded = self
            .uploader
            .upload(&package, self.workspace_id.as_ref(), &self.cancel, Some(&report))
            .await;
        drop(package);

        match uploaded {
            Ok(uploaded) => Ok(uploaded.package_id),
            Err(UploadError::Cancelled) => Err(PublishError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    fn progress(&self, fraction: f64) {
        if let Err(e) = self.feedback.report_progress(&self.step, fraction) {
            debug!(step = %self.step, error = %e, "Could not report progress");
        }
    }
}
