//! Subcommand implementations

pub mod auth;
pub mod config;
pub mod maps;
pub mod publish;
pub mod workspaces;
