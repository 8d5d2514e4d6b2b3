//! Maps command - list recently updated maps

use anyhow::{bail, Context, Result};
use atlaspub_api::lists::{FetchOutcome, MapFilter, RecentMapsModel};
use atlaspub_core::domain::WorkspaceId;
use clap::Subcommand;

use crate::context::AppContext;

#[derive(Debug, Subcommand)]
pub enum MapsCommand {
    /// List recent maps
    List {
        /// Only maps whose title matches this text
        #[arg(long)]
        search: Option<String>,
        /// Only maps in this workspace
        #[arg(long)]
        workspace: Option<WorkspaceId>,
    },
}

impl MapsCommand {
    pub async fn execute(&self, ctx: &AppContext) -> Result<()> {
        match self {
            MapsCommand::List { search, workspace } => {
                execute_list(ctx, search.clone(), workspace.clone()).await
            }
        }
    }
}

async fn execute_list(
    ctx: &AppContext,
    search: Option<String>,
    workspace_id: Option<WorkspaceId>,
) -> Result<()> {
    let fmt = ctx.formatter();
    let model = RecentMapsModel::new(ctx.gateway()?);

    let results = match model
        .set_filter(MapFilter {
            search,
            workspace_id,
        })
        .await
    {
        FetchOutcome::Completed(results) => results,
        FetchOutcome::Superseded => bail!("Map listing was interrupted"),
    };

    if let Some(error) = &results.error {
        if results.items.is_empty() {
            return Err(error.clone()).context("Failed to list maps");
        }
        fmt.warn(&format!("Listing stopped early: {}", error));
    }

    if ctx.is_json() {
        fmt.print_json(&serde_json::json!({
            "maps": results.items,
            "complete": results.is_complete(),
        }));
        return Ok(());
    }

    if results.items.is_empty() {
        fmt.info("No maps found.");
        return Ok(());
    }

    fmt.success(&format!("{} map(s)", results.items.len()));
    for map in &results.items {
        let layers = map.layers.len();
        match &map.url {
            Some(url) => fmt.info(&format!("{:<24} {} ({layers} layers) {url}", map.id.as_str(), map.title)),
            None => fmt.info(&format!("{:<24} {} ({layers} layers)", map.id.as_str(), map.title)),
        }
    }
    Ok(())
}
