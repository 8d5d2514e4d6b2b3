//! Config command - show and validate the effective configuration
//!
//! The effective configuration is the YAML file (or built-in defaults when
//! it does not exist) with the `ATLASPUB_API_BASE_URL` override applied.

use anyhow::{Context, Result};
use atlaspub_core::config::{Config, ValidationError};
use clap::Subcommand;
use tracing::info;

use crate::context::AppContext;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration
    Show,
    /// Validate configuration file
    Validate,
    /// Print the configuration file location
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &AppContext) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(ctx),
            ConfigCommand::Validate => execute_validate(ctx),
            ConfigCommand::Path => {
                let fmt = ctx.formatter();
                if ctx.is_json() {
                    fmt.print_json(&serde_json::json!({
                        "config_path": ctx.config_path.display().to_string(),
                        "exists": ctx.config_path.exists(),
                    }));
                } else {
                    println!("{}", ctx.config_path.display());
                }
                Ok(())
            }
        }
    }
}

fn execute_show(ctx: &AppContext) -> Result<()> {
    let fmt = ctx.formatter();
    info!(config_path = %ctx.config_path.display(), "Showing configuration");

    if ctx.is_json() {
        let json =
            serde_json::to_value(&ctx.config).context("Failed to serialize configuration")?;
        fmt.print_json(&json);
        return Ok(());
    }

    let source = if ctx.config_path.exists() {
        ctx.config_path.display().to_string()
    } else {
        format!("defaults; {} not found", ctx.config_path.display())
    };
    fmt.success(&format!("Configuration ({source})"));
    fmt.info("");
    for line in ctx.config.to_yaml()?.lines() {
        fmt.info(line);
    }
    Ok(())
}

fn execute_validate(ctx: &AppContext) -> Result<()> {
    let fmt = ctx.formatter();

    // A file that exists but doesn't parse is an error of its own
    if ctx.config_path.exists() {
        if let Err(e) = Config::load(&ctx.config_path) {
            report(ctx, &[format!("{e:#}")]);
            return Ok(());
        }
    } else {
        fmt.info(&format!(
            "No configuration file at {}; validating defaults",
            ctx.config_path.display()
        ));
    }

    let errors: Vec<String> = ctx
        .config
        .validate()
        .iter()
        .map(ValidationError::to_string)
        .collect();
    report(ctx, &errors);
    Ok(())
}

fn report(ctx: &AppContext, errors: &[String]) {
    let fmt = ctx.formatter();
    if ctx.is_json() {
        fmt.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": ctx.config_path.display().to_string(),
            "errors": errors,
        }));
    } else if errors.is_empty() {
        fmt.success("Configuration is valid");
    } else {
        fmt.error(&format!(
            "Configuration has {} error{}:",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        for error in errors {
            fmt.info(&format!("- {error}"));
        }
    }
}
