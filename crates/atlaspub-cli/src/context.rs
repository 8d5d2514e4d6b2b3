//! Shared state for command execution
//!
//! Resolves the configuration file and builds the authenticated gateway
//! every networked command goes through.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use atlaspub_api::{auth::AuthWorkflow, client::ApiGateway, storage::KeyringTokenStorage};
use atlaspub_core::config::Config;
use tracing::debug;

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

pub struct AppContext {
    pub config: Config,
    pub config_path: PathBuf,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl AppContext {
    /// Loads the config file (or defaults) and applies the base URL override
    pub fn load(
        config_path: Option<PathBuf>,
        api_base_url: Option<String>,
        format: OutputFormat,
        quiet: bool,
    ) -> Self {
        let config_path = config_path.unwrap_or_else(Config::default_path);
        let mut config = Config::load_or_default(&config_path);
        if let Some(base_url) = api_base_url {
            debug!(base_url = %base_url, "Overriding API base URL");
            config.api.base_url = base_url;
        }
        Self {
            config,
            config_path,
            format,
            quiet,
        }
    }

    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format, self.quiet)
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Auth workflow restored from the system keyring
    pub fn auth(&self) -> Result<Arc<AuthWorkflow>> {
        let storage = Arc::new(KeyringTokenStorage::new());
        let auth = AuthWorkflow::new(&self.config.api, storage)
            .context("Failed to initialise authentication")?;
        auth.restore().context("Failed to restore the saved session")?;
        Ok(Arc::new(auth))
    }

    /// Gateway sharing a restored auth workflow
    pub fn gateway(&self) -> Result<Arc<ApiGateway>> {
        let auth = self.auth()?;
        let gateway =
            ApiGateway::new(&self.config, auth).context("Failed to create the API client")?;
        Ok(Arc::new(gateway))
    }
}
