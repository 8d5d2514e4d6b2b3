//! Atlaspub API - client for the remote map service
//!
//! Provides the async building blocks of the publishing pipeline that talk
//! to the network:
//! - OAuth2 device-code login, token refresh and persisted sessions
//! - A single REST gateway with retry, backoff and typed error mapping
//! - Cursor pagination and latest-request-wins list models
//! - Pre-signed, optionally multi-part package uploads
//!
//! ## Modules
//!
//! - [`auth`] - Login state machine and coalesced token refresh
//! - [`storage`] - Credential persistence adapters (system keyring, memory)
//! - [`client`] - The [`ApiGateway`](client::ApiGateway) REST facade
//! - [`retry`] - Backoff policy and `Retry-After` parsing
//! - [`pagination`] - Lazy, restartable page sequences
//! - [`lists`] - Recent maps and workspaces list models
//! - [`upload`] - Package upload through pre-signed storage targets

pub mod auth;
pub mod client;
pub mod lists;
pub mod pagination;
pub mod retry;
pub mod storage;
pub mod upload;

use thiserror::Error;

/// Errors raised by the login and token lifecycle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The user explicitly declined the device authorization
    #[error("Login was denied")]
    Denied,

    /// The device code expired before the user approved it
    #[error("Login timed out before it was approved")]
    Timeout,

    /// No usable session: the refresh failed or was rejected, or nobody is
    /// logged in. The caller must prompt for a new login.
    #[error("Session expired, please log in again")]
    Expired,

    /// `poll_or_complete` was called without a pending `begin_login`
    #[error("No login is in progress")]
    NotPending,

    /// The authorization server could not be reached
    #[error("Authentication service unreachable: {0}")]
    Unreachable(String),

    /// Credentials could not be read from or written to persistent storage
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// The authorization server answered with something unexpected
    #[error("Authentication protocol error: {0}")]
    Protocol(String),
}

/// Errors returned by [`ApiGateway`](client::ApiGateway) calls
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Authentication failed; `Auth(AuthError::Expired)` needs a re-login
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A network-level failure (connect, timeout, reset) that outlasted retries
    #[error("Network error: {0}")]
    Transient(String),

    /// The service kept answering 429 or 5xx until retries were exhausted
    #[error("Service unavailable (HTTP {status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    /// The service rejected the request (4xx other than 401/429)
    #[error("Request rejected (HTTP {status}, {code}): {message}")]
    Request {
        status: u16,
        /// Stable server error code, e.g. `map_not_found`
        code: String,
        message: String,
    },

    /// The response could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Returns true for failures that may succeed if the call is repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Transient(_) | ApiError::ServiceUnavailable { .. }
        )
    }

    /// Returns true if the session is gone and the user must log in again
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::Auth(AuthError::Expired))
    }

    /// Server error code carried by a rejected request
    pub fn server_code(&self) -> Option<&str> {
        match self {
            ApiError::Request { code, .. } => Some(code),
            _ => None,
        }
    }
}
