//! Credential persistence adapters
//!
//! - [`KeyringTokenStorage`] - the OS credential store (GNOME Keyring,
//!   KWallet, macOS Keychain, Windows Credential Manager)
//! - [`MemoryTokenStorage`] - process-local storage for ephemeral sessions
//!   and tests

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use atlaspub_core::{domain::Credentials, ports::TokenStorage};
use tracing::{debug, info};

/// Default keyring service name
pub const KEYRING_SERVICE: &str = "atlaspub";

// ============================================================================
// KeyringTokenStorage
// ============================================================================

/// Stores credentials in the system keyring
///
/// Credentials are serialized as JSON under the configured service name,
/// with the account key as the keyring username.
#[derive(Debug, Clone)]
pub struct KeyringTokenStorage {
    service: String,
}

impl KeyringTokenStorage {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    /// Uses a custom keyring service name
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringTokenStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStorage for KeyringTokenStorage {
    fn store(&self, account: &str, credentials: &Credentials) -> Result<()> {
        let json =
            serde_json::to_string(credentials).context("Failed to serialize credentials")?;

        self.entry(account)?
            .set_password(&json)
            .context("Failed to store credentials in keyring")?;

        debug!(account, "Stored credentials in keyring");
        Ok(())
    }

    fn load(&self, account: &str) -> Result<Option<Credentials>> {
        match self.entry(account)?.get_password() {
            Ok(json) => {
                let credentials: Credentials = serde_json::from_str(&json)
                    .context("Failed to deserialize credentials from keyring")?;
                debug!(account, "Loaded credentials from keyring");
                Ok(Some(credentials))
            }
            Err(keyring::Error::NoEntry) => {
                debug!(account, "No credentials found in keyring");
                Ok(None)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to read from keyring")),
        }
    }

    fn clear(&self, account: &str) -> Result<()> {
        match self.entry(account)?.delete_credential() {
            Ok(()) => {
                info!(account, "Cleared credentials from keyring");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                debug!(account, "No credentials to clear");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to delete from keyring")),
        }
    }
}

// ============================================================================
// MemoryTokenStorage
// ============================================================================

/// Keeps credentials in memory only; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    entries: Mutex<HashMap<String, Credentials>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage pre-populated with credentials for `account`
    pub fn with_credentials(account: &str, credentials: Credentials) -> Self {
        let storage = Self::new();
        storage
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string(), credentials);
        storage
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn store(&self, account: &str, credentials: &Credentials) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string(), credentials.clone());
        Ok(())
    }

    fn load(&self, account: &str) -> Result<Option<Credentials>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account)
            .cloned())
    }

    fn clear(&self, account: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(account);
        Ok(())
    }
}
