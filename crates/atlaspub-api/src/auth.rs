//! OAuth2 device-code login and token lifecycle
//!
//! Implements the Device Authorization Grant (RFC 8628) for a desktop
//! client that cannot host a redirect: the user approves access in a
//! browser while the client polls the token endpoint.
//!
//! ## State machine
//!
//! ```text
//!   LoggedOut ──begin_login──► AwaitingUserAction ──poll_or_complete──► Authenticating ──► LoggedIn
//!       ▲                              │                                       │               │
//!       │                              └──────── denied / timeout ─────────────┘               │
//!       │                                                                                      ▼
//!       └─────────────── refresh rejected ◄──────────── TokenExpired ◄──── near expiry / 401 ──┘
//!                                                           │
//!                                                           └── refresh ok ──► LoggedIn
//! ```
//!
//! ## Refresh coalescing
//!
//! All refreshes go through one async mutex (the refresh slot). A caller
//! that finds the token stale takes the slot, re-checks the token, and only
//! then refreshes. Callers queued behind it find a fresh token on their
//! re-check and return it, so a burst of callers produces one refresh call.
//! A queued caller also returns without refreshing when the access token it
//! saw before queueing was replaced while it waited.
//!
//! A token is due for refresh `refresh_margin` before it expires, or half
//! way through its lifetime when the server issues one shorter than twice
//! the margin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use atlaspub_core::{
    config::ApiConfig,
    domain::{Credentials, User},
    ports::TokenStorage,
};
use chrono::{DateTime, Utc};
use oauth2::{
    basic::{BasicClient, BasicTokenResponse},
    ClientId, DeviceAuthorizationUrl, DeviceCodeErrorResponseType, EndpointNotSet, EndpointSet,
    ErrorResponse, HttpClientError, RefreshToken, RequestTokenError, Scope,
    StandardDeviceAuthorizationResponse, TokenResponse, TokenUrl,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::AuthError;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Credentials in use and the moment they become due for refresh
#[derive(Clone)]
struct Session {
    credentials: Credentials,
    refresh_at: DateTime<Utc>,
}

impl Session {
    /// Credentials loaded from storage; their original lifetime is unknown
    fn restored(credentials: Credentials, margin: chrono::Duration) -> Self {
        Self {
            refresh_at: credentials.expires_at - margin,
            credentials,
        }
    }

    /// Credentials the token endpoint just issued
    fn issued(credentials: Credentials, margin: chrono::Duration) -> Self {
        let lifetime = credentials.expires_at - Utc::now();
        let margin = margin.min(lifetime / 2).max(chrono::Duration::zero());
        Self {
            refresh_at: credentials.expires_at - margin,
            credentials,
        }
    }

    fn is_fresh(&self) -> bool {
        Utc::now() < self.refresh_at
    }
}

type DeviceClient =
    BasicClient<EndpointNotSet, EndpointSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

// ============================================================================
// AuthState / DeviceLogin
// ============================================================================

/// Login state, observable through [`AuthWorkflow::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    LoggedOut,
    /// A device code was issued; waiting for the user to approve it
    AwaitingUserAction,
    /// Exchanging the approved grant for tokens
    Authenticating,
    LoggedIn,
    /// The access token is stale and a refresh is pending or in flight
    TokenExpired,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthState::LoggedOut => "logged out",
            AuthState::AwaitingUserAction => "awaiting user action",
            AuthState::Authenticating => "authenticating",
            AuthState::LoggedIn => "logged in",
            AuthState::TokenExpired => "token expired",
        };
        write!(f, "{}", s)
    }
}

/// What the user needs to approve a pending login
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceLogin {
    pub verification_uri: String,
    /// Verification URI with the user code embedded, if the server offers one
    pub verification_uri_complete: Option<String>,
    pub user_code: String,
    /// How long the code stays valid
    #[serde(with = "duration_secs")]
    pub expires_in: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

// ============================================================================
// AuthWorkflow
// ============================================================================

/// Drives login, refresh and logout for one account
///
/// Share it behind an `Arc`: the gateway and every upload worker call
/// [`ensure_valid_token`](Self::ensure_valid_token) concurrently.
pub struct AuthWorkflow {
    oauth: DeviceClient,
    http: reqwest::Client,
    base_url: String,
    scopes: Vec<String>,
    account: String,
    refresh_margin: chrono::Duration,
    login_timeout: Duration,
    storage: Arc<dyn TokenStorage>,
    session: Mutex<Option<Session>>,
    user: Mutex<Option<User>>,
    pending: tokio::sync::Mutex<Option<StandardDeviceAuthorizationResponse>>,
    refresh_slot: tokio::sync::Mutex<()>,
    refresh_count: AtomicU64,
    state_tx: watch::Sender<AuthState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn credentials_from(token: &BasicTokenResponse, previous_refresh: Option<&str>) -> Credentials {
    let expires_at = token
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d)
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

    Credentials {
        access_token: token.access_token().secret().to_string(),
        refresh_token: token
            .refresh_token()
            .map(|t| t.secret().to_string())
            .or_else(|| previous_refresh.map(str::to_string)),
        expires_at,
    }
}

fn describe_request_error<T: ErrorResponse + std::fmt::Display>(
    err: &RequestTokenError<HttpClientError<reqwest::Error>, T>,
) -> String {
    match err {
        RequestTokenError::ServerResponse(resp) => resp.to_string(),
        RequestTokenError::Request(e) => e.to_string(),
        RequestTokenError::Parse(e, _) => format!("malformed token response: {e}"),
        RequestTokenError::Other(msg) => msg.clone(),
    }
}

impl AuthWorkflow {
    /// Creates a workflow from the API configuration
    ///
    /// # Errors
    /// Returns `AuthError::Protocol` if an OAuth endpoint URL is invalid.
    pub fn new(config: &ApiConfig, storage: Arc<dyn TokenStorage>) -> Result<Self, AuthError> {
        let oauth = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_token_uri(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| AuthError::Protocol(format!("invalid token URL: {e}")))?,
            )
            .set_device_authorization_url(
                DeviceAuthorizationUrl::new(config.device_authorization_url.clone()).map_err(
                    |e| AuthError::Protocol(format!("invalid device authorization URL: {e}")),
                )?,
            );

        // OAuth endpoints are never followed through redirects.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AuthError::Protocol(format!("failed to build HTTP client: {e}")))?;

        let (state_tx, _) = watch::channel(AuthState::LoggedOut);

        Ok(Self {
            oauth,
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            scopes: config.scopes.clone(),
            account: config.account.clone(),
            refresh_margin: config.refresh_margin(),
            login_timeout: config.login_timeout(),
            storage,
            session: Mutex::new(None),
            user: Mutex::new(None),
            pending: tokio::sync::Mutex::new(None),
            refresh_slot: tokio::sync::Mutex::new(()),
            refresh_count: AtomicU64::new(0),
            state_tx,
        })
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns true while credentials are held (fresh or awaiting refresh)
    pub fn is_logged_in(&self) -> bool {
        matches!(self.state(), AuthState::LoggedIn | AuthState::TokenExpired)
    }

    /// Number of refresh calls issued to the token endpoint
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// When the current access token expires
    pub fn expires_at(&self) -> Option<chrono::DateTime<Utc>> {
        lock(&self.session).as_ref().map(|s| s.credentials.expires_at)
    }

    fn set_state(&self, state: AuthState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Auth state changed");
        }
    }

    fn fresh_token(&self) -> Option<String> {
        lock(&self.session)
            .as_ref()
            .filter(|s| s.is_fresh())
            .map(|s| s.credentials.access_token.clone())
    }

    fn credentials_snapshot(&self) -> Option<Credentials> {
        lock(&self.session).as_ref().map(|s| s.credentials.clone())
    }

    fn install(&self, credentials: Credentials) -> Result<(), AuthError> {
        self.storage
            .store(&self.account, &credentials)
            .map_err(|e| AuthError::Storage(format!("{e:#}")))?;
        *lock(&self.session) = Some(Session::issued(credentials, self.refresh_margin));
        Ok(())
    }

    fn drop_session(&self) {
        *lock(&self.session) = None;
        *lock(&self.user) = None;
        if let Err(e) = self.storage.clear(&self.account) {
            warn!(account = %self.account, error = %format!("{e:#}"), "Failed to clear stored credentials");
        }
        self.set_state(AuthState::LoggedOut);
    }

    // ------------------------------------------------------------------------
    // Session restore
    // ------------------------------------------------------------------------

    /// Loads persisted credentials, if any
    ///
    /// Enters `LoggedIn` for a usable token, `TokenExpired` for a stale one
    /// (refreshed on the next [`ensure_valid_token`](Self::ensure_valid_token)),
    /// or `LoggedOut` when nothing is stored.
    pub fn restore(&self) -> Result<AuthState, AuthError> {
        let stored = self
            .storage
            .load(&self.account)
            .map_err(|e| AuthError::Storage(format!("{e:#}")))?;

        let state = match stored {
            Some(credentials) => {
                let state = if credentials.expires_within(self.refresh_margin) {
                    AuthState::TokenExpired
                } else {
                    AuthState::LoggedIn
                };
                *lock(&self.session) = Some(Session::restored(credentials, self.refresh_margin));
                state
            }
            None => AuthState::LoggedOut,
        };

        info!(account = %self.account, state = %state, "Restored session");
        self.set_state(state);
        Ok(state)
    }

    // ------------------------------------------------------------------------
    // Device-code login
    // ------------------------------------------------------------------------

    /// Requests a device authorization grant
    ///
    /// Returns the verification URL and user code to show the user. Any
    /// previously pending grant is discarded.
    ///
    /// # Errors
    /// `Unreachable` if the authorization server cannot be contacted,
    /// `Protocol` if it rejects the request.
    pub async fn begin_login(&self) -> Result<DeviceLogin, AuthError> {
        info!(account = %self.account, "Requesting device authorization");

        let mut request = self.oauth.exchange_device_code();
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let details: StandardDeviceAuthorizationResponse = request
            .request_async(&self.http)
            .await
            .map_err(|e| match &e {
                RequestTokenError::Request(_) => {
                    AuthError::Unreachable(describe_request_error(&e))
                }
                _ => AuthError::Protocol(describe_request_error(&e)),
            })?;

        let login = DeviceLogin {
            verification_uri: details.verification_uri().to_string(),
            verification_uri_complete: details
                .verification_uri_complete()
                .map(|u| u.secret().to_string()),
            user_code: details.user_code().secret().to_string(),
            expires_in: details.expires_in(),
        };

        *self.pending.lock().await = Some(details);
        self.set_state(AuthState::AwaitingUserAction);
        Ok(login)
    }

    /// Waits for the user to approve the pending grant and completes login
    ///
    /// Polls the token endpoint at the server-requested interval. On success
    /// the credentials are persisted, the user profile is fetched, and the
    /// state becomes `LoggedIn`. Denial or expiry of the device code returns
    /// to `LoggedOut` without storing anything.
    ///
    /// # Errors
    /// `NotPending` without a prior [`begin_login`](Self::begin_login);
    /// `Denied`, `Timeout`, `Unreachable`, `Storage` or `Protocol` otherwise.
    /// If only the profile fetch fails, the session is kept and the error
    /// is returned.
    pub async fn poll_or_complete(&self) -> Result<User, AuthError> {
        let details = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(AuthError::NotPending)?;

        self.set_state(AuthState::Authenticating);
        debug!(interval_secs = details.interval().as_secs(), "Polling for device approval");

        let result = self
            .oauth
            .exchange_device_access_token(&details)
            .request_async(&self.http, tokio::time::sleep, Some(self.login_timeout))
            .await;

        let token = match result {
            Ok(token) => token,
            Err(e) => {
                let err = match &e {
                    RequestTokenError::ServerResponse(resp) => match resp.error() {
                        DeviceCodeErrorResponseType::AccessDenied => AuthError::Denied,
                        DeviceCodeErrorResponseType::ExpiredToken => AuthError::Timeout,
                        _ => AuthError::Protocol(describe_request_error(&e)),
                    },
                    RequestTokenError::Request(_) => {
                        AuthError::Unreachable(describe_request_error(&e))
                    }
                    _ => AuthError::Protocol(describe_request_error(&e)),
                };
                warn!(account = %self.account, error = %err, "Device login failed");
                self.set_state(AuthState::LoggedOut);
                return Err(err);
            }
        };

        let credentials = credentials_from(&token, None);
        if let Err(e) = self.install(credentials) {
            self.set_state(AuthState::LoggedOut);
            return Err(e);
        }
        *lock(&self.user) = None;
        self.set_state(AuthState::LoggedIn);
        info!(account = %self.account, "Login complete");

        self.current_user().await
    }

    // ------------------------------------------------------------------------
    // Token validity and refresh
    // ------------------------------------------------------------------------

    /// Returns an access token that is not about to expire
    ///
    /// Refreshes first if the token expires within the configured margin.
    /// Concurrent callers share a single in-flight refresh.
    ///
    /// # Errors
    /// `Expired` when nobody is logged in or the refresh was rejected (the
    /// session is then cleared); `Unreachable` when the refresh could not
    /// reach the server (the session is kept).
    pub async fn ensure_valid_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        let seen = self.credentials_snapshot().map(|c| c.access_token);

        let _slot = self.refresh_slot.lock().await;
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let Some(credentials) = self.credentials_snapshot() else {
            self.set_state(AuthState::LoggedOut);
            return Err(AuthError::Expired);
        };

        // Replaced by whoever held the slot before us
        if seen.as_deref() != Some(credentials.access_token.as_str()) && !credentials.is_expired() {
            return Ok(credentials.access_token);
        }

        if !credentials.can_refresh() {
            if !credentials.is_expired() {
                return Ok(credentials.access_token);
            }
            info!(account = %self.account, "Access token expired and cannot be refreshed");
            self.drop_session();
            return Err(AuthError::Expired);
        }

        self.refresh_locked(&credentials).await
    }

    /// Refreshes after the server rejected `stale_token` with a 401
    ///
    /// If another caller already replaced `stale_token`, the current token
    /// is returned without a new refresh.
    pub async fn force_refresh(&self, stale_token: &str) -> Result<String, AuthError> {
        let _slot = self.refresh_slot.lock().await;

        let Some(credentials) = self.credentials_snapshot() else {
            self.set_state(AuthState::LoggedOut);
            return Err(AuthError::Expired);
        };

        if credentials.access_token != stale_token {
            return Ok(credentials.access_token);
        }

        if !credentials.can_refresh() {
            info!(account = %self.account, "Access token rejected and cannot be refreshed");
            self.drop_session();
            return Err(AuthError::Expired);
        }

        self.refresh_locked(&credentials).await
    }

    /// Performs the refresh; the caller holds the refresh slot
    async fn refresh_locked(&self, current: &Credentials) -> Result<String, AuthError> {
        let refresh_token = current.refresh_token.clone().unwrap_or_default();

        self.set_state(AuthState::TokenExpired);
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        info!(account = %self.account, "Refreshing access token");

        let result = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&self.http)
            .await;

        match result {
            Ok(token) => {
                let credentials = credentials_from(&token, Some(&refresh_token));
                let access_token = credentials.access_token.clone();
                if let Err(e) = self.storage.store(&self.account, &credentials) {
                    // The new session still works for this process.
                    warn!(account = %self.account, error = %format!("{e:#}"), "Failed to persist refreshed credentials");
                }
                *lock(&self.session) = Some(Session::issued(credentials, self.refresh_margin));
                self.set_state(AuthState::LoggedIn);
                info!(account = %self.account, "Access token refreshed");
                Ok(access_token)
            }
            Err(e @ RequestTokenError::ServerResponse(_)) => {
                warn!(account = %self.account, error = %describe_request_error(&e), "Refresh rejected, logging out");
                self.drop_session();
                Err(AuthError::Expired)
            }
            Err(e) => {
                let message = describe_request_error(&e);
                warn!(account = %self.account, error = %message, "Refresh failed, keeping session");
                let state = if current.is_expired() {
                    AuthState::TokenExpired
                } else {
                    AuthState::LoggedIn
                };
                self.set_state(state);
                Err(match e {
                    RequestTokenError::Request(_) => AuthError::Unreachable(message),
                    _ => AuthError::Protocol(message),
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // User identity and logout
    // ------------------------------------------------------------------------

    /// Returns the signed-in user, fetching the profile if not cached
    pub async fn current_user(&self) -> Result<User, AuthError> {
        if let Some(user) = lock(&self.user).clone() {
            return Ok(user);
        }

        let token = self.ensure_valid_token().await?;
        let user = self.fetch_user(&token).await?;
        *lock(&self.user) = Some(user.clone());
        Ok(user)
    }

    async fn fetch_user(&self, token: &str) -> Result<User, AuthError> {
        let url = format!("{}/user", self.base_url);
        debug!("Fetching user profile");

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<User>()
                .await
                .map_err(|e| AuthError::Protocol(format!("malformed user profile: {e}"))),
            reqwest::StatusCode::UNAUTHORIZED => Err(AuthError::Expired),
            status => Err(AuthError::Protocol(format!(
                "GET /user returned HTTP {}",
                status.as_u16()
            ))),
        }
    }

    /// Clears credentials and the cached user
    ///
    /// Idempotent. Storage errors are returned after the in-memory session
    /// has been cleared.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let _slot = self.refresh_slot.lock().await;
        *self.pending.lock().await = None;
        *lock(&self.session) = None;
        *lock(&self.user) = None;
        self.set_state(AuthState::LoggedOut);

        self.storage
            .clear(&self.account)
            .map_err(|e| AuthError::Storage(format!("{e:#}")))?;
        info!(account = %self.account, "Logged out");
        Ok(())
    }
}

impl std::fmt::Debug for AuthWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthWorkflow")
            .field("account", &self.account)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
