//! Gateway retry, 401 handling, error mapping and pagination

use atlaspub_api::{ApiError, AuthError};
use atlaspub_core::domain::{MapId, PackageId, Workspace};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{self, ACCESS_TOKEN};

fn map_id(id: &str) -> MapId {
    MapId::new(id).unwrap()
}

#[tokio::test]
async fn test_rate_limited_call_is_retried() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::map_json("m1", "Roads")))
        .mount(&server)
        .await;

    let map = gateway.get_map(&map_id("m1")).await.expect("get_map");

    assert_eq!(map.title, "Roads");
    assert_eq!(gateway.retry_count(), 2);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = gateway.get_map(&map_id("m1")).await.unwrap_err();

    assert!(
        matches!(err, ApiError::ServiceUnavailable { status: 503, .. }),
        "got {err:?}"
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": "map_not_found", "message": "No such map"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = gateway.get_map(&map_id("missing")).await.unwrap_err();

    assert_eq!(
        err,
        ApiError::Request {
            status: 404,
            code: "map_not_found".to_string(),
            message: "No such map".to_string(),
        }
    );
    assert_eq!(err.server_code(), Some("map_not_found"));
    assert_eq!(gateway.retry_count(), 0);
}

#[tokio::test]
async fn test_unauthorized_refreshes_and_replays_once() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .and(header("authorization", format!("Bearer {ACCESS_TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .and(header("authorization", "Bearer refreshed-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::map_json("m1", "Roads")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("refresh_token="))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::token_body("refreshed-token", None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let map = gateway.get_map(&map_id("m1")).await.expect("replayed call");

    assert_eq!(map.id.as_str(), "m1");
    assert_eq!(gateway.auth().refresh_count(), 1);
    assert_eq!(gateway.retry_count(), 0);
}

#[tokio::test]
async fn test_second_unauthorized_is_session_expired() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::token_body("refreshed-token", None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = gateway.get_map(&map_id("m1")).await.unwrap_err();

    assert_eq!(err, ApiError::Auth(AuthError::Expired));
    assert!(err.requires_login());
}

#[tokio::test]
async fn test_logged_out_gateway_makes_no_request() {
    let server = MockServer::start().await;
    let config = common::test_config(&server).build();
    let gateway = common::gateway_for(&config, None);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = gateway.get_map(&map_id("m1")).await.unwrap_err();
    assert!(err.requires_login());
}

#[tokio::test]
async fn test_pagination_follows_cursor() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/workspaces"))
        .and(query_param("cursor", "c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "ws-3", "name": "Three"}],
            "next_cursor": null
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workspaces"))
        .and(query_param("page_size", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "ws-1", "name": "One"}, {"id": "ws-2", "name": "Two"}],
            "next_cursor": "c2"
        })))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let mut pages = gateway.list_workspaces().with_page_size(2);
    let first = pages.next_page().await.unwrap().unwrap();
    assert_eq!(first.len(), 2);
    assert!(!pages.is_done());
    let second = pages.next_page().await.unwrap().unwrap();
    assert_eq!(second[0].name, "Three");
    assert!(pages.is_done());
    assert!(pages.next_page().await.is_none());
    assert_eq!(pages.pages_fetched(), 2);
}

#[tokio::test]
async fn test_pagination_failure_keeps_partial_results() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/workspaces"))
        .and(query_param("cursor", "c2"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": "bad_cursor", "message": "Cursor is invalid"}
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workspaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "ws-1", "name": "One"}],
            "next_cursor": "c2"
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let results = gateway.list_workspaces().collect_all().await;

    assert!(!results.is_complete());
    assert_eq!(
        results.items,
        vec![Workspace {
            id: "ws-1".parse().unwrap(),
            name: "One".to_string()
        }]
    );
    assert_eq!(
        results.error.as_ref().and_then(|e| e.server_code()),
        Some("bad_cursor")
    );
}

#[tokio::test]
async fn test_list_maps_sends_filters() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps"))
        .and(query_param("search", "roads"))
        .and(query_param("workspace_id", "ws-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [common::map_json("m1", "Roads")],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = "ws-1".parse().unwrap();
    let maps = gateway
        .list_maps(Some("  roads "), Some(&workspace))
        .collect_all()
        .await
        .into_result()
        .unwrap();

    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0].title, "Roads");
}

#[tokio::test]
async fn test_create_map_posts_package_ids() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("POST"))
        .and(path("/maps"))
        .and(wiremock::matchers::body_json(json!({
            "title": "Rivers",
            "workspace_id": null,
            "package_ids": ["pkg-1", "pkg-2"]
        })))
        .and(header("Idempotency-Key", "run-42"))
        .respond_with(ResponseTemplate::new(201).set_body_json(common::map_json("m9", "Rivers")))
        .expect(1)
        .mount(&server)
        .await;

    let packages = vec![PackageId::new("pkg-1").unwrap(), PackageId::new("pkg-2").unwrap()];
    let map = gateway
        .create_map("Rivers", None, &packages, "run-42")
        .await
        .unwrap();

    assert_eq!(map.id.as_str(), "m9");
}

#[tokio::test]
async fn test_retried_commit_reuses_idempotency_key() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("POST"))
        .and(path("/maps/m1/layers"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/maps/m1/layers"))
        .and(header("Idempotency-Key", "run-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::map_json("m1", "Roads")))
        .mount(&server)
        .await;

    let packages = vec![PackageId::new("pkg-3").unwrap()];
    gateway
        .append_layers(&map_id("m1"), &packages, "run-7")
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.headers.get("Idempotency-Key").unwrap(), "run-7");
    }
}

#[tokio::test]
async fn test_read_calls_carry_no_idempotency_key() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::map_json("m1", "Roads")))
        .mount(&server)
        .await;

    gateway.get_map(&map_id("m1")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("Idempotency-Key").is_none());
}
