//! atlaspub CLI - publish local geospatial layers as hosted maps
//!
//! Provides commands for:
//! - Logging in with the device-code flow
//! - Listing recent maps and workspaces
//! - Publishing layers from a directory as a new or existing map
//! - Inspecting the configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod output;

use commands::{
    auth::AuthCommand, config::ConfigCommand, maps::MapsCommand, publish::PublishCommand,
    workspaces::WorkspacesCommand,
};
use context::AppContext;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "atlaspub", version, about = "Publish local layers to a hosted map service")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long, env = "ATLASPUB_API_BASE_URL", global = true)]
    api_url: Option<String>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Authentication commands
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Browse maps
    #[command(subcommand)]
    Maps(MapsCommand),
    /// Browse workspaces
    #[command(subcommand)]
    Workspaces(WorkspacesCommand),
    /// Publish layers as a map
    Publish(PublishCommand),
    /// View configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

fn init_tracing(verbose: u8, configured_level: &str, json: bool) {
    let level = match verbose {
        0 => configured_level,
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let ctx = AppContext::load(cli.config, cli.api_url, format, cli.quiet);
    init_tracing(cli.verbose, &ctx.config.logging.level, cli.json);

    match cli.command {
        Commands::Auth(cmd) => cmd.execute(&ctx).await,
        Commands::Maps(cmd) => cmd.execute(&ctx).await,
        Commands::Workspaces(cmd) => cmd.execute(&ctx).await,
        Commands::Publish(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
    }
}
