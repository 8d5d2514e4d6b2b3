//! Recent maps and workspaces models: filtering and latest-request-wins

use std::sync::Arc;
use std::time::Duration;

use atlaspub_api::lists::{FetchOutcome, MapFilter, RecentMapsModel, WorkspacesModel};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_newer_filter_supersedes_slow_fetch() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps"))
        .and(query_param("search", "lakes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [common::map_json("m2", "Lakes")],
            "next_cursor": null
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/maps"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "data": [common::map_json("m1", "Roads")],
                    "next_cursor": null
                }))
                .set_delay(Duration::from_millis(500)),
        )
        .with_priority(2)
        .mount(&server)
        .await;

    let model = Arc::new(RecentMapsModel::new(gateway));
    let slow = {
        let model = Arc::clone(&model);
        tokio::spawn(async move { model.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = model
        .set_filter(MapFilter {
            search: Some("lakes".to_string()),
            workspace_id: None,
        })
        .await;

    assert!(matches!(fast, FetchOutcome::Completed(ref r) if r.items.len() == 1));
    assert_eq!(slow.await.unwrap(), FetchOutcome::Superseded);

    let maps = model.maps();
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0].title, "Lakes");
    let snapshot = model.subscribe().borrow().clone();
    assert!(!snapshot.loading);
    assert_eq!(snapshot.generation, 2);
}

#[tokio::test]
async fn test_failed_refresh_publishes_error_with_partial_items() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/maps"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": "forbidden", "message": "No access"}
        })))
        .mount(&server)
        .await;

    let model = RecentMapsModel::new(gateway);
    let outcome = model.refresh().await;

    let FetchOutcome::Completed(results) = outcome else {
        panic!("expected a completed fetch");
    };
    assert!(results.items.is_empty());
    let snapshot = model.subscribe().borrow().clone();
    assert_eq!(
        snapshot.error.as_ref().and_then(|e| e.server_code()),
        Some("forbidden")
    );
}

#[tokio::test]
async fn test_default_workspace_is_first_listed() {
    let (server, gateway) = common::setup_gateway().await;

    Mock::given(method("GET"))
        .and(path("/workspaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "ws-a", "name": "Alpha"}, {"id": "ws-b", "name": "Beta"}],
        })))
        .mount(&server)
        .await;

    let model = WorkspacesModel::new(gateway);
    assert!(model.default_workspace().is_none());

    model.refresh().await;

    assert_eq!(model.workspaces().len(), 2);
    assert_eq!(model.default_workspace().unwrap().name, "Alpha");
}
