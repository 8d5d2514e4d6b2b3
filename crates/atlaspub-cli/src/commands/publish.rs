//! Publish command - export layers from a directory and publish them as a map
//!
//! Streams step progress from the run's feedback channel while the run is
//! in flight. Ctrl-C requests cancellation; a run that already reached its
//! commit point finishes anyway.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atlaspub_api::lists::WorkspacesModel;
use atlaspub_core::{
    domain::{LayerRef, MapId, MapTarget, PackageFormat, WorkspaceId},
    feedback::{MultiStepFeedback, StepState},
};
use atlaspub_publish::{
    orchestrator::{MapUploaderTask, PublishRequest},
    source::GeoJsonDirectorySource,
};
use tracing::{debug, info};

use crate::context::AppContext;
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, clap::Args)]
pub struct PublishCommand {
    /// Layer files to publish, relative to --dir (default: every layer found)
    pub layers: Vec<LayerRef>,

    /// Directory holding the layer files
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Title of the new map
    #[arg(long, required_unless_present = "map", conflicts_with = "map")]
    pub title: Option<String>,

    /// Workspace for the new map (default: the account's first workspace)
    #[arg(long, conflicts_with = "map")]
    pub workspace: Option<WorkspaceId>,

    /// Append the layers to this existing map instead
    #[arg(long)]
    pub map: Option<MapId>,

    /// Preferred package format (geojson, csv, geotiff)
    #[arg(long)]
    pub format: Option<PackageFormat>,
}

impl PublishCommand {
    pub async fn execute(&self, ctx: &AppContext) -> Result<()> {
        let fmt = ctx.formatter();
        let gateway = ctx.gateway()?;
        let source = Arc::new(GeoJsonDirectorySource::new(&self.dir));

        let layers = if self.layers.is_empty() {
            source.list()?
        } else {
            self.layers.clone()
        };
        if layers.is_empty() {
            anyhow::bail!("No publishable layers found in {}", self.dir.display());
        }

        let target = match (&self.map, &self.title) {
            (Some(map_id), _) => MapTarget::Existing(map_id.clone()),
            (None, title) => {
                let workspace_id = match &self.workspace {
                    Some(id) => Some(id.clone()),
                    None => default_workspace(&gateway).await,
                };
                MapTarget::New {
                    title: title.clone().unwrap_or_default(),
                    workspace_id,
                }
            }
        };

        let task = Arc::new(MapUploaderTask::new(&ctx.config, gateway, source));
        info!(run = %task.run_id(), target = %target, layers = layers.len(), "Publishing");
        fmt.info(&format!("Publishing {} layer(s) to {}", layers.len(), target));

        let printer = tokio::spawn(print_progress(
            Arc::clone(task.feedback()),
            ctx.format,
            ctx.quiet,
        ));

        let request = PublishRequest::new(target, layers).with_format_hint(self.format);
        let run = task.run(request);
        tokio::pin!(run);

        let mut interrupted = false;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                signal = tokio::signal::ctrl_c(), if !interrupted => {
                    if let Err(e) = signal {
                        debug!(error = %e, "Ctrl-C handler unavailable");
                    }
                    interrupted = true;
                    fmt.warn("Cancelling publish...");
                    task.cancel();
                }
            }
        };
        printer.abort();

        match result {
            Ok(map) => {
                if ctx.is_json() {
                    fmt.print_json(&serde_json::json!({
                        "success": true,
                        "run_id": task.run_id(),
                        "map": map,
                        "feedback": task.feedback().snapshot(),
                    }));
                } else {
                    fmt.success(&format!("Published \"{}\" ({})", map.title, map.id));
                    if let Some(url) = &map.url {
                        fmt.info(url);
                    }
                }
                Ok(())
            }
            Err(e) => {
                if ctx.is_json() {
                    fmt.print_json(&serde_json::json!({
                        "success": false,
                        "run_id": task.run_id(),
                        "error": e.to_string(),
                        "requires_login": e.requires_login(),
                        "feedback": task.feedback().snapshot(),
                    }));
                } else {
                    for step in task.feedback().steps() {
                        if let Some(error) = &step.error {
                            fmt.info(&format!("{}: {}", step.name, error));
                        }
                    }
                    if e.requires_login() {
                        fmt.info("Run `atlaspub auth login` and try again.");
                    }
                }
                Err(e).context("Publish failed")
            }
        }
    }
}

/// First workspace of the account, if it can be fetched
async fn default_workspace(gateway: &Arc<atlaspub_api::client::ApiGateway>) -> Option<WorkspaceId> {
    let model = WorkspacesModel::new(Arc::clone(gateway));
    model.refresh().await;
    let workspace = model.default_workspace().map(|w| w.id);
    debug!(workspace = ?workspace, "Resolved default workspace");
    workspace
}

/// Prints each step transition until aborted
async fn print_progress(feedback: Arc<MultiStepFeedback>, format: OutputFormat, quiet: bool) {
    let fmt = get_formatter(format, quiet);
    let mut rx = feedback.subscribe();
    let mut seen: HashMap<String, StepState> = HashMap::new();

    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        for step in &snapshot.steps {
            if seen.get(&step.name) == Some(&step.state) {
                continue;
            }
            seen.insert(step.name.clone(), step.state);
            if step.state != StepState::Pending {
                fmt.progress(
                    snapshot.overall_progress * 100.0,
                    &format!("{} {}", step.name, step.state),
                );
            }
        }
    }
}
