//! Credential persistence port
//!
//! Credentials must survive a process restart and be erasable on logout.
//! The storage format is left to the adapter (system keyring, memory, ...).

use crate::domain::Credentials;

/// Port trait for persisting OAuth credentials, keyed by account
///
/// ## Design Notes
///
/// - Uses `anyhow::Result` because failures are adapter-specific
///   (keyring daemon unavailable, permission denied) and are reported
///   to the user verbatim rather than classified.
/// - Methods are synchronous: every known backend is a blocking local call.
pub trait TokenStorage: Send + Sync {
    /// Stores credentials for the given account, replacing any previous value
    fn store(&self, account: &str, credentials: &Credentials) -> anyhow::Result<()>;

    /// Loads credentials for the given account
    ///
    /// # Returns
    /// `Some(Credentials)` if present, `None` if nothing is stored
    fn load(&self, account: &str) -> anyhow::Result<Option<Credentials>>;

    /// Removes credentials for the given account
    ///
    /// Succeeds when nothing is stored.
    fn clear(&self, account: &str) -> anyhow::Result<()>;
}
