//! REST gateway for the remote map service
//!
//! [`ApiGateway`] is the single point of contact with the REST API. Every
//! call is signed with a bearer token from [`AuthWorkflow`], retried with
//! backoff on transient failures, and mapped into [`ApiError`].
//!
//! ## Retry rules
//!
//! | Outcome                    | Handling                                          |
//! |----------------------------|---------------------------------------------------|
//! | network error / timeout    | retried, then `ApiError::Transient`               |
//! | 429, 5xx                   | retried (honouring `Retry-After`), then `ServiceUnavailable` |
//! | 401                        | one forced refresh and one replay, then `Auth(Expired)` |
//! | other 4xx                  | not retried, `ApiError::Request` with server code |
//!
//! Calls that create state on the server (map commits, upload completion)
//! carry an `Idempotency-Key` header that stays the same across retries, so
//! a request whose response was lost is not applied twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use atlaspub_api::{auth::AuthWorkflow, client::ApiGateway, storage::KeyringTokenStorage};
//! use atlaspub_core::config::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let auth = Arc::new(AuthWorkflow::new(&config.api, Arc::new(KeyringTokenStorage::new()))?);
//! auth.restore()?;
//! let gateway = ApiGateway::new(&config, auth)?;
//! let workspaces = gateway.list_workspaces().collect_all().await;
//! println!("{} workspaces", workspaces.items.len());
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atlaspub_core::{
    config::Config,
    domain::{Map, MapId, PackageId, Workspace, WorkspaceId},
};
use reqwest::{header::RETRY_AFTER, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthWorkflow,
    pagination::Paginator,
    retry::{parse_retry_after, RetryPolicy},
    ApiError, AuthError,
};

/// Header naming the logical operation a retried request belongs to
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

// ============================================================================
// Error bodies
// ============================================================================

/// `{"error": {"code": "...", "message": "..."}}` or the same keys at top level
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Extracts `(code, message)` from an error response body
fn parse_error_body(status: StatusCode, body: &str) -> (String, String) {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let (code, message) = match parsed.error {
        Some(detail) => (detail.code, detail.message),
        None => (parsed.code, parsed.message),
    };

    let code = code.unwrap_or_else(|| format!("http_{}", status.as_u16()));
    let message = message
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| match body.trim() {
            "" => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
            text => text.chars().take(200).collect(),
        });
    (code, message)
}

/// Reads a JSON body, `Value::Null` when empty
async fn read_json(path: &str, response: Response) -> Result<Value, ApiError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Transient(format!("failed to read response body: {e}")))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidResponse(format!("{path}: {e}")))
}

async fn read_error(response: Response) -> (StatusCode, String, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let (code, message) = parse_error_body(status, &body);
    (status, code, message)
}

// ============================================================================
// ApiGateway
// ============================================================================

/// Authenticated, retrying client for the REST API
pub struct ApiGateway {
    client: Client,
    base_url: String,
    auth: Arc<AuthWorkflow>,
    retry: RetryPolicy,
    page_size: u32,
    retry_waits: AtomicU64,
}

impl ApiGateway {
    /// Creates a gateway from the configuration
    pub fn new(config: &Config, auth: Arc<AuthWorkflow>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.api.request_timeout())
            .build()
            .map_err(|e| ApiError::InvalidResponse(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            auth,
            retry: RetryPolicy::from_config(&config.retry),
            page_size: config.publish.page_size.max(1),
            retry_waits: AtomicU64::new(0),
        })
    }

    /// Overrides the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn auth(&self) -> &Arc<AuthWorkflow> {
        &self.auth
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns the underlying HTTP client
    ///
    /// Used for requests to absolute, pre-signed storage URLs, which must
    /// not carry the bearer token.
    pub fn http_client(&self) -> &Client {
        &self.client
    }

    /// Number of backoff sleeps performed across all calls
    pub fn retry_count(&self) -> u64 {
        self.retry_waits.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    // ========================================================================
    // call / execute
    // ========================================================================

    /// Issues an authenticated request and returns the successful response
    ///
    /// Applies the retry rules described in the module documentation.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Response, ApiError> {
        self.send(method, path, body, query, None).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut token = self.auth.ensure_valid_token().await?;
        let mut attempts: u32 = 0;
        let mut waited = Duration::ZERO;
        let mut replayed_after_401 = false;

        loop {
            attempts += 1;

            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(key) = idempotency_key {
                request = request.header(IDEMPOTENCY_KEY, key);
            }

            debug!(method = %method, path, attempt = attempts, "Sending API request");

            let (failure, retry_after) = match request.send().await {
                Err(e) => (ApiError::Transient(e.to_string()), None),
                Ok(response) if response.status().is_success() => {
                    if attempts > 1 {
                        info!(path, attempts, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    if replayed_after_401 {
                        warn!(path, "Token rejected after refresh");
                        return Err(ApiError::Auth(AuthError::Expired));
                    }
                    replayed_after_401 = true;
                    debug!(path, "Received 401, refreshing token");
                    token = self.auth.force_refresh(&token).await?;
                    // The replay does not consume a retry attempt.
                    attempts -= 1;
                    continue;
                }
                Ok(response)
                    if response.status() == StatusCode::TOO_MANY_REQUESTS
                        || response.status().is_server_error() =>
                {
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    let (status, _code, message) = read_error(response).await;
                    (
                        ApiError::ServiceUnavailable {
                            status: status.as_u16(),
                            message,
                        },
                        retry_after,
                    )
                }
                Ok(response) => {
                    let (status, code, message) = read_error(response).await;
                    debug!(path, status = status.as_u16(), code = %code, "Request rejected");
                    return Err(ApiError::Request {
                        status: status.as_u16(),
                        code,
                        message,
                    });
                }
            };

            let Some(delay) = self.retry.next_delay(attempts, waited, retry_after) else {
                warn!(path, attempts, error = %failure, "Retries exhausted");
                return Err(failure);
            };

            warn!(
                path,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Transient failure, backing off"
            );
            self.retry_waits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            waited += delay;
        }
    }

    /// Issues a request and returns the JSON body (`Value::Null` when empty)
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        let response = self.execute(method, path, body, query).await?;
        read_json(path, response).await
    }

    /// Issues a request and deserializes the JSON body into `T`
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let value = self.call(method, path, body, query).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(format!("{path}: {e}")))
    }

    /// POSTs `body` under an idempotency key and deserializes the reply
    ///
    /// Every attempt of the call sends the same key.
    pub async fn post_idempotent<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: &str,
    ) -> Result<T, ApiError> {
        let response = self
            .send(Method::POST, path, Some(body), &[], Some(idempotency_key))
            .await?;
        let value = read_json(path, response).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(format!("{path}: {e}")))
    }

    // ========================================================================
    // Pagination
    // ========================================================================

    /// Returns a lazy page sequence over a cursor-paginated list endpoint
    pub fn paginate<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> Paginator<'_, T> {
        Paginator::new(self, path, query, self.page_size)
    }

    /// `GET /workspaces`
    pub fn list_workspaces(&self) -> Paginator<'_, Workspace> {
        self.paginate("/workspaces", Vec::new())
    }

    /// `GET /maps`, optionally filtered by a search string and workspace
    pub fn list_maps(
        &self,
        search: Option<&str>,
        workspace_id: Option<&WorkspaceId>,
    ) -> Paginator<'_, Map> {
        let mut query = Vec::new();
        if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
            query.push(("search", search.to_string()));
        }
        if let Some(workspace_id) = workspace_id {
            query.push(("workspace_id", workspace_id.to_string()));
        }
        self.paginate("/maps", query)
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// `GET /maps/{id}`, including the map's published layers
    pub async fn get_map(&self, id: &MapId) -> Result<Map, ApiError> {
        self.call_json(Method::GET, &format!("/maps/{id}"), None, &[])
            .await
    }

    /// `POST /maps`: creates a map from uploaded packages
    ///
    /// `idempotency_key` identifies the commit; retries reuse it.
    pub async fn create_map(
        &self,
        title: &str,
        workspace_id: Option<&WorkspaceId>,
        package_ids: &[PackageId],
        idempotency_key: &str,
    ) -> Result<Map, ApiError> {
        let body = json!({
            "title": title,
            "workspace_id": workspace_id,
            "package_ids": package_ids,
        });
        let map: Map = self.post_idempotent("/maps", &body, idempotency_key).await?;
        info!(map = %map.id, layers = package_ids.len(), "Created map");
        Ok(map)
    }

    /// `POST /maps/{id}/layers`: appends uploaded packages to an existing map
    pub async fn append_layers(
        &self,
        map_id: &MapId,
        package_ids: &[PackageId],
        idempotency_key: &str,
    ) -> Result<Map, ApiError> {
        let body = json!({ "package_ids": package_ids });
        let map: Map = self
            .post_idempotent(&format!("/maps/{map_id}/layers"), &body, idempotency_key)
            .await?;
        info!(map = %map.id, layers = package_ids.len(), "Appended layers to map");
        Ok(map)
    }
}

impl std::fmt::Debug for ApiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiGateway")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
