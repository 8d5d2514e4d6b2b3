//! Shared fixtures: a stateful fake map service and layer directories

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use atlaspub_api::{auth::AuthWorkflow, client::ApiGateway, storage::MemoryTokenStorage};
use atlaspub_core::{
    config::{Config, ConfigBuilder},
    domain::Credentials,
};
use atlaspub_publish::source::GeoJsonDirectorySource;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub fn test_config(server: &MockServer) -> ConfigBuilder {
    ConfigBuilder::new()
        .api_server(&server.uri())
        .api_request_timeout_secs(5)
        .retry_max_attempts(2)
        .retry_initial_backoff_ms(1)
        .retry_max_backoff_ms(5)
        .upload_max_attempts(1)
        .publish_concurrency(2)
}

/// Gateway restored from in-memory credentials (`None` = logged out)
pub fn gateway(config: &Config, logged_in: bool) -> Arc<ApiGateway> {
    let storage = if logged_in {
        MemoryTokenStorage::with_credentials(
            &config.api.account,
            Credentials {
                access_token: "test-access-token".into(),
                refresh_token: Some("test-refresh-token".into()),
                expires_at: Utc::now() + Duration::hours(1),
            },
        )
    } else {
        MemoryTokenStorage::new()
    };
    let auth = Arc::new(AuthWorkflow::new(&config.api, Arc::new(storage)).expect("auth"));
    auth.restore().expect("restore");
    Arc::new(ApiGateway::new(config, auth).expect("gateway"))
}

// ============================================================================
// Layer fixtures
// ============================================================================

pub struct LayerDir {
    pub dir: TempDir,
}

impl LayerDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn source(&self) -> Arc<GeoJsonDirectorySource> {
        Arc::new(GeoJsonDirectorySource::new(self.dir.path()))
    }

    /// Writes a point layer with `count` features
    pub fn points(&self, name: &str, count: usize) -> &Self {
        let features: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [i as f64, (i * 2) as f64]},
                    "properties": {"id": i, "label": format!("feature number {i}")}
                })
            })
            .collect();
        self.write(
            name,
            &json!({"type": "FeatureCollection", "features": features}).to_string(),
        )
    }

    pub fn write(&self, name: &str, contents: &str) -> &Self {
        std::fs::write(self.dir.path().join(name), contents).expect("write layer");
        self
    }
}

// ============================================================================
// Fake map service
// ============================================================================

#[derive(Default)]
struct State {
    /// completion token → upload metadata
    uploads: HashMap<String, Value>,
    /// package id → upload metadata
    packages: HashMap<String, Value>,
    maps: HashMap<String, Value>,
}

/// Stateful responders for the upload and map endpoints
///
/// Remembers the metadata registered with each upload so a published map
/// reports its layers the way the real service would.
#[derive(Clone, Default)]
pub struct FakeMapService {
    state: Arc<Mutex<State>>,
}

fn body(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap_or(Value::Null)
}

fn stem(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_string()
}

struct Uploads {
    service: FakeMapService,
    base: String,
}

impl Respond for Uploads {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let metadata = body(request);
        let stem = stem(metadata["file_name"].as_str().unwrap_or("layer"));
        let token = format!("ct-{stem}");
        self.service
            .state
            .lock()
            .unwrap()
            .uploads
            .insert(token.clone(), metadata);
        ResponseTemplate::new(201).set_body_json(json!({
            "upload_url": format!("{}/storage/{stem}?X-Signature=secret", self.base),
            "method": "PUT",
            "headers": {},
            "completion_token": token,
            "expires_at": (Utc::now() + Duration::minutes(10)).to_rfc3339(),
        }))
    }
}

struct Complete(FakeMapService);

impl Respond for Complete {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let token = body(request)["completion_token"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let mut state = self.0.state.lock().unwrap();
        let Some(metadata) = state.uploads.get(&token).cloned() else {
            return ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"code": "unknown_token", "message": token}}));
        };
        let package_id = token.replacen("ct-", "pkg-", 1);
        state.packages.insert(package_id.clone(), metadata);
        ResponseTemplate::new(200).set_body_json(json!({"package_id": package_id}))
    }
}

struct PublishMap {
    service: FakeMapService,
    map_id: String,
}

impl Respond for PublishMap {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let request_body = body(request);
        let mut state = self.service.state.lock().unwrap();

        let mut layers = Vec::new();
        for id in request_body["package_ids"].as_array().cloned().unwrap_or_default() {
            let id = id.as_str().unwrap_or_default().to_string();
            let Some(metadata) = state.packages.get(&id) else {
                return ResponseTemplate::new(400)
                    .set_body_json(json!({"error": {"code": "unknown_package", "message": id}}));
            };
            layers.push(json!({
                "name": stem(metadata["file_name"].as_str().unwrap_or_default()),
                "package_id": id,
                "format": metadata["format"],
                "crs": metadata["crs"],
                "geometry_type": metadata["geometry_type"],
                "feature_count": metadata["feature_count"],
            }));
        }

        let map = state.maps.entry(self.map_id.clone()).or_insert_with(|| {
            json!({
                "id": self.map_id,
                "title": request_body["title"].as_str().unwrap_or("Existing map"),
                "workspace_id": request_body["workspace_id"],
                "layers": [],
            })
        });
        if let Some(existing) = map["layers"].as_array_mut() {
            existing.extend(layers);
        }
        ResponseTemplate::new(201).set_body_json(map.clone())
    }
}

struct GetMap(FakeMapService);

impl Respond for GetMap {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let id = request.url.path().rsplit('/').next().unwrap_or_default();
        match self.0.state.lock().unwrap().maps.get(id) {
            Some(map) => ResponseTemplate::new(200).set_body_json(map.clone()),
            None => ResponseTemplate::new(404)
                .set_body_json(json!({"error": {"code": "map_not_found", "message": id}})),
        }
    }
}

impl FakeMapService {
    /// Mounts every endpoint a publish run touches
    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/uploads"))
            .respond_with(Uploads {
                service: self.clone(),
                base: server.uri(),
            })
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex("^/storage/"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag\""))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/uploads/complete"))
            .respond_with(Complete(self.clone()))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/maps"))
            .respond_with(PublishMap {
                service: self.clone(),
                map_id: "map-new".into(),
            })
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/maps/map-existing/layers"))
            .respond_with(PublishMap {
                service: self.clone(),
                map_id: "map-existing".into(),
            })
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex("^/maps/[^/]+$"))
            .respond_with(GetMap(self.clone()))
            .mount(server)
            .await;
    }
}

/// Number of received requests matching `method` and `path` exactly
pub async fn count_requests(server: &MockServer, method: &str, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .count()
}
