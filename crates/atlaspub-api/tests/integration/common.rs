//! Shared helpers for the integration tests
//!
//! Every endpoint (OAuth, REST and storage) is served by one MockServer.
//! Retry delays are shrunk to milliseconds so failure paths run quickly.

use std::sync::Arc;

use atlaspub_api::{auth::AuthWorkflow, client::ApiGateway, storage::MemoryTokenStorage};
use atlaspub_core::{
    config::{Config, ConfigBuilder},
    domain::Credentials,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ACCESS_TOKEN: &str = "test-access-token";
pub const REFRESH_TOKEN: &str = "test-refresh-token";

/// Fast-retry configuration pointing at `server`
pub fn test_config(server: &MockServer) -> ConfigBuilder {
    ConfigBuilder::new()
        .api_server(&server.uri())
        .api_request_timeout_secs(5)
        .retry_max_attempts(3)
        .retry_initial_backoff_ms(1)
        .retry_max_backoff_ms(5)
        .retry_max_total_wait_ms(1_000)
}

pub fn credentials(expires_in: Duration, refresh: Option<&str>) -> Credentials {
    Credentials {
        access_token: ACCESS_TOKEN.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_at: Utc::now() + expires_in,
    }
}

pub fn valid_credentials() -> Credentials {
    credentials(Duration::hours(1), Some(REFRESH_TOKEN))
}

/// An auth workflow restored from in-memory storage holding `stored`
pub fn restored_auth(
    config: &Config,
    stored: Option<Credentials>,
) -> (Arc<AuthWorkflow>, Arc<MemoryTokenStorage>) {
    let storage = Arc::new(match stored {
        Some(creds) => MemoryTokenStorage::with_credentials(&config.api.account, creds),
        None => MemoryTokenStorage::new(),
    });
    let auth = Arc::new(AuthWorkflow::new(&config.api, storage.clone()).expect("auth workflow"));
    auth.restore().expect("restore");
    (auth, storage)
}

/// Starts a server and returns a gateway logged in with valid credentials
pub async fn setup_gateway() -> (MockServer, Arc<ApiGateway>) {
    let server = MockServer::start().await;
    let config = test_config(&server).build();
    let gateway = gateway_for(&config, Some(valid_credentials()));
    (server, gateway)
}

pub fn gateway_for(config: &Config, stored: Option<Credentials>) -> Arc<ApiGateway> {
    let (auth, _storage) = restored_auth(config, stored);
    Arc::new(ApiGateway::new(config, auth).expect("gateway"))
}

/// Token endpoint success body
pub fn token_body(access: &str, refresh: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}

/// Mounts `GET /user` for requests carrying `token`
pub async fn mount_user(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "user-1",
            "name": "Test User",
            "email": "test@example.com"
        })))
        .mount(server)
        .await;
}

pub fn map_json(id: &str, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "workspace_id": "ws-1",
        "url": format!("https://maps.example.com/{id}"),
        "layers": []
    })
}
