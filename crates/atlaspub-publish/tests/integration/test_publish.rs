//! End-to-end publish runs against the fake map service

use std::sync::Arc;

use atlaspub_core::domain::{
    Crs, GeometryType, LayerRef, MapId, MapTarget, PackageFormat, WorkspaceId,
};
use atlaspub_core::feedback::{OverallState, StepState};
use atlaspub_publish::export::ExportError;
use atlaspub_publish::orchestrator::{layer_step, MapUploaderTask, PublishRequest, FINALIZE_STEP};
use atlaspub_publish::PublishError;
use atlaspub_api::upload::UploadError;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{count_requests, gateway, test_config, FakeMapService, LayerDir};

fn layer(name: &str) -> LayerRef {
    LayerRef::new(name).unwrap()
}

fn new_map(title: &str) -> MapTarget {
    MapTarget::New {
        title: title.to_string(),
        workspace_id: Some(WorkspaceId::new("ws-1").unwrap()),
    }
}

#[tokio::test]
async fn test_publish_new_map_round_trip() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 12).write("roads.crs", "epsg:3857\n");

    let config = test_config(&server).build();
    let gateway = gateway(&config, true);
    let task = MapUploaderTask::new(&config, gateway.clone(), layers.source());

    let map = task
        .run(PublishRequest::new(new_map("Roads"), [layer("roads.geojson")]))
        .await
        .unwrap();

    assert_eq!(map.id.as_str(), "map-new");
    assert_eq!(map.title, "Roads");
    assert_eq!(task.feedback().overall_state(), OverallState::Succeeded);
    assert!((task.feedback().overall_progress() - 1.0).abs() < 1e-9);

    // Reading the map back reports what was exported
    let fetched = gateway.get_map(&MapId::new("map-new").unwrap()).await.unwrap();
    assert_eq!(fetched.layers.len(), 1);
    let published = &fetched.layers[0];
    assert_eq!(published.name, "roads");
    assert_eq!(published.feature_count, Some(12));
    assert_eq!(published.crs, Some(Crs::new("EPSG:3857").unwrap()));
    assert_eq!(published.format, Some(PackageFormat::GeoJson));
    assert_eq!(published.geometry_type, Some(GeometryType::Point));
    assert_eq!(
        published.package_id.as_ref().map(|p| p.as_str()),
        Some("pkg-roads")
    );
}

#[tokio::test]
async fn test_commit_and_completion_carry_idempotency_keys() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 3);

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());
    task.run(PublishRequest::new(new_map("Roads"), [layer("roads.geojson")]))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let key_of = |path: &str| {
        requests
            .iter()
            .find(|r| r.method.as_str() == "POST" && r.url.path() == path)
            .and_then(|r| r.headers.get("Idempotency-Key"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    assert_eq!(key_of("/maps"), Some(task.run_id().to_string()));
    assert_eq!(key_of("/uploads/complete"), Some("ct-roads".to_string()));
    assert_eq!(key_of("/uploads"), None);
}

#[tokio::test]
async fn test_publish_several_layers_commits_once() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers
        .points("a.geojson", 2)
        .points("b.geojson", 3)
        .points("c.geojson", 4);

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());
    let map = task
        .run(PublishRequest::new(
            new_map("Three"),
            [layer("a.geojson"), layer("b.geojson"), layer("c.geojson")],
        ))
        .await
        .unwrap();

    let mut names: Vec<_> = map.layers.iter().map(|l| l.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(count_requests(&server, "POST", "/uploads").await, 3);
    assert_eq!(count_requests(&server, "POST", "/uploads/complete").await, 3);
    assert_eq!(count_requests(&server, "POST", "/maps").await, 1);

    for name in ["a.geojson", "b.geojson", "c.geojson"] {
        let step = task.feedback().step(&layer_step(&layer(name))).unwrap();
        assert_eq!(step.state, StepState::Succeeded);
    }
}

#[tokio::test]
async fn test_oversized_layer_fails_run_before_any_upload() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers
        .points("small-1.geojson", 1)
        .points("huge.geojson", 200)
        .points("small-2.geojson", 1);

    let config = test_config(&server).export_max_layer_bytes(2_000).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());

    let err = task
        .run(PublishRequest::new(
            new_map("Too big"),
            [
                layer("small-1.geojson"),
                layer("huge.geojson"),
                layer("small-2.geojson"),
            ],
        ))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::Export(ExportError::LayerTooLarge { limit: 2_000, .. })
    ));

    let feedback = task.feedback();
    assert_eq!(feedback.overall_state(), OverallState::Failed);
    assert_eq!(
        feedback.step(&layer_step(&layer("huge.geojson"))).unwrap().state,
        StepState::Failed
    );
    for name in ["small-1.geojson", "small-2.geojson"] {
        assert_eq!(
            feedback.step(&layer_step(&layer(name))).unwrap().state,
            StepState::Cancelled
        );
    }
    assert_eq!(
        feedback.step(FINALIZE_STEP).unwrap().state,
        StepState::Cancelled
    );

    let (failed_step, _) = feedback.first_failure().unwrap();
    assert_eq!(failed_step, layer_step(&layer("huge.geojson")));

    assert_eq!(count_requests(&server, "POST", "/uploads").await, 0);
    assert_eq!(count_requests(&server, "POST", "/maps").await, 0);
}

#[tokio::test]
async fn test_unsupported_layer_is_rejected() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 3).write("cloud.las", "LASF");

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());

    let err = task
        .run(PublishRequest::new(
            new_map("Points"),
            [layer("roads.geojson"), layer("cloud.las")],
        ))
        .await
        .unwrap_err();

    match err {
        PublishError::Export(ExportError::UnsupportedLayer { layer, .. }) => {
            assert_eq!(layer, "cloud.las")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(count_requests(&server, "POST", "/uploads").await, 0);
}

#[tokio::test]
async fn test_cancel_before_start_makes_no_calls() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 3);

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());
    task.cancel();

    let err = task
        .run(PublishRequest::new(new_map("Roads"), [layer("roads.geojson")]))
        .await
        .unwrap_err();

    assert_eq!(err, PublishError::Cancelled);
    assert_eq!(task.feedback().overall_state(), OverallState::Cancelled);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_logged_out_requires_login_before_any_step() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 3);

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, false), layers.source());

    let err = task
        .run(PublishRequest::new(new_map("Roads"), [layer("roads.geojson")]))
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Auth(_)));
    assert!(err.requires_login());
    assert!(task.feedback().steps().is_empty());
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_append_to_existing_map() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("lakes.geojson", 5);

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());

    let map = task
        .run(PublishRequest::new(
            MapTarget::Existing(MapId::new("map-existing").unwrap()),
            [layer("lakes.geojson")],
        ))
        .await
        .unwrap();

    assert_eq!(map.id.as_str(), "map-existing");
    assert_eq!(map.layers.len(), 1);
    assert_eq!(map.layers[0].feature_count, Some(5));
    assert_eq!(
        count_requests(&server, "POST", "/maps/map-existing/layers").await,
        1
    );
    assert_eq!(count_requests(&server, "POST", "/maps").await, 0);
}

#[tokio::test]
async fn test_csv_format_hint_is_honoured() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("stations.geojson", 4);

    let config = test_config(&server).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());

    let map = task
        .run(
            PublishRequest::new(new_map("Stations"), [layer("stations.geojson")])
                .with_format_hint(Some(PackageFormat::Csv)),
        )
        .await
        .unwrap();

    assert_eq!(map.layers[0].format, Some(PackageFormat::Csv));
    assert_eq!(map.layers[0].package_id.as_ref().map(|p| p.as_str()), Some("pkg-stations"));
}

#[tokio::test]
async fn test_storage_failure_skips_commit() {
    let server = MockServer::start().await;
    // Higher priority than the fake's storage mock
    Mock::given(method("PUT"))
        .and(path_regex("^/storage/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk on fire"))
        .with_priority(1)
        .mount(&server)
        .await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 3);

    let config = test_config(&server).upload_max_attempts(1).build();
    let task = MapUploaderTask::new(&config, gateway(&config, true), layers.source());

    let err = task
        .run(PublishRequest::new(new_map("Roads"), [layer("roads.geojson")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::Upload(UploadError::Failed { attempts: 1, .. })
    ));
    assert_eq!(task.feedback().overall_state(), OverallState::Failed);
    assert_eq!(
        task.feedback().step(FINALIZE_STEP).unwrap().state,
        StepState::Cancelled
    );
    assert_eq!(count_requests(&server, "POST", "/uploads/complete").await, 0);
    assert_eq!(count_requests(&server, "POST", "/maps").await, 0);
}

#[tokio::test]
async fn test_feedback_subscription_reaches_completion() {
    let server = MockServer::start().await;
    FakeMapService::default().mount(&server).await;

    let layers = LayerDir::new();
    layers.points("roads.geojson", 3);

    let config = test_config(&server).build();
    let task = Arc::new(MapUploaderTask::new(
        &config,
        gateway(&config, true),
        layers.source(),
    ));
    let mut rx = task.feedback().subscribe();

    let runner = {
        let task = task.clone();
        tokio::spawn(async move {
            task.run(PublishRequest::new(new_map("Roads"), [layer("roads.geojson")]))
                .await
        })
    };

    let mut last_progress = 0.0;
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.overall_progress + 1e-9 >= last_progress, "progress went backwards");
        last_progress = snapshot.overall_progress;
        if snapshot.overall_state == OverallState::Succeeded {
            break;
        }
    }

    runner.await.unwrap().unwrap();
    assert_eq!(task.feedback().overall_state(), OverallState::Succeeded);
}
