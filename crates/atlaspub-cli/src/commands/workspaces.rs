//! Workspaces command

use anyhow::{bail, Context, Result};
use atlaspub_api::lists::{FetchOutcome, WorkspacesModel};
use clap::Subcommand;

use crate::context::AppContext;

#[derive(Debug, Subcommand)]
pub enum WorkspacesCommand {
    /// List the account's workspaces
    List,
}

impl WorkspacesCommand {
    pub async fn execute(&self, ctx: &AppContext) -> Result<()> {
        match self {
            WorkspacesCommand::List => execute_list(ctx).await,
        }
    }
}

async fn execute_list(ctx: &AppContext) -> Result<()> {
    let fmt = ctx.formatter();
    let model = WorkspacesModel::new(ctx.gateway()?);

    let results = match model.refresh().await {
        FetchOutcome::Completed(results) => results,
        FetchOutcome::Superseded => bail!("Workspace listing was interrupted"),
    };
    if let Some(error) = &results.error {
        if results.items.is_empty() {
            return Err(error.clone()).context("Failed to list workspaces");
        }
        fmt.warn(&format!("Listing stopped early: {}", error));
    }

    let default = model.default_workspace();

    if ctx.is_json() {
        fmt.print_json(&serde_json::json!({
            "workspaces": results.items,
            "default": default.map(|w| w.id),
        }));
        return Ok(());
    }

    if results.items.is_empty() {
        fmt.info("No workspaces.");
        return Ok(());
    }
    for workspace in &results.items {
        let marker = if Some(&workspace.id) == default.as_ref().map(|w| &w.id) {
            "*"
        } else {
            " "
        };
        fmt.info(&format!("{marker} {:<24} {}", workspace.id.as_str(), workspace.name));
    }
    Ok(())
}
