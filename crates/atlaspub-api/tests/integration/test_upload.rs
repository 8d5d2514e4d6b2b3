//! Package upload against mock parameter, storage and completion endpoints

use std::sync::{Arc, Mutex};

use atlaspub_api::upload::{UploadCoordinator, UploadError};
use atlaspub_core::{
    config::UploadConfig,
    domain::{Crs, GeometryType, LayerPackage, LayerRef, PackageFormat},
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common;

fn package(bytes: &[u8]) -> LayerPackage {
    LayerPackage {
        source_layer_ref: LayerRef::new("roads").unwrap(),
        name: "roads".to_string(),
        format: PackageFormat::GeoJson,
        bytes: bytes.to_vec(),
        byte_length: bytes.len() as u64,
        crs: Crs::wgs84(),
        geometry_type: GeometryType::Line,
        feature_count: Some(2),
        checksum: "c2hhMjU2".to_string(),
    }
}

fn upload_config(max_attempts: u32, expired_restarts: u32) -> UploadConfig {
    UploadConfig {
        max_attempts,
        part_parallelism: 2,
        expired_restarts,
    }
}

fn parameters(server: &MockServer, part_size: Option<u64>, expires_in: Duration) -> Value {
    json!({
        "upload_url": format!("{}/storage/roads?X-Signature=secret", server.uri()),
        "method": "PUT",
        "headers": {"x-storage-class": "standard"},
        "part_size": part_size,
        "completion_token": "ct-1",
        "expires_at": (Utc::now() + expires_in).to_rfc3339(),
    })
}

async fn mount_parameters(server: &MockServer, body: Value, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(201).set_body_json(body))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_storage_ok(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path("/storage/roads"))
        .and(header("x-storage-class", "standard"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-ok\""))
        .with_priority(5)
        .mount(server)
        .await;
}

async fn mount_complete(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/uploads/complete"))
        .and(body_partial_json(json!({"completion_token": "ct-1"})))
        .and(header("Idempotency-Key", "ct-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"package_id": "pkg-1"})))
        .with_priority(5)
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_single_part_upload_registers_package() {
    let (server, gateway) = common::setup_gateway().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .and(body_partial_json(json!({
            "file_name": "roads.geojson",
            "format": "geojson",
            "byte_length": 10,
            "checksum": "c2hhMjU2",
            "crs": "EPSG:4326",
            "geometry_type": "line",
            "feature_count": 2
        })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(parameters(&server, None, Duration::minutes(10))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/storage/roads"))
        .and(header("content-type", "application/geo+json"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-1\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/uploads/complete"))
        .and(body_partial_json(json!({
            "completion_token": "ct-1",
            "parts": [{"part_number": 1, "etag": "etag-1"}]
        })))
        .and(header("Idempotency-Key", "ct-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"package_id": "pkg-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = UploadCoordinator::new(gateway, &upload_config(3, 1));
    let uploaded = coordinator
        .upload(&package(b"0123456789"), None, &CancellationToken::new(), None)
        .await
        .expect("upload");

    assert_eq!(uploaded.package_id.as_str(), "pkg-1");
    assert_eq!(uploaded.parts, 1);
    assert_eq!(uploaded.attempts, 1);
}

#[tokio::test]
async fn test_multi_part_upload_reports_progress() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, Some(4), Duration::minutes(10)), 1).await;
    Mock::given(method("PUT"))
        .and(path("/storage/roads"))
        .and(header("x-part-number", "3"))
        .and(header("content-range", "bytes 8-9/10"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-3\""))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_storage_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/uploads/complete"))
        .and(body_partial_json(json!({
            "parts": [
                {"part_number": 1, "etag": "etag-ok"},
                {"part_number": 2, "etag": "etag-ok"},
                {"part_number": 3, "etag": "etag-3"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"package_id": "pkg-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        move |done: u64, total: u64| seen.lock().unwrap().push((done, total))
    };

    let coordinator = UploadCoordinator::new(gateway, &upload_config(3, 1));
    let uploaded = coordinator
        .upload(
            &package(b"0123456789"),
            None,
            &CancellationToken::new(),
            Some(&recorder),
        )
        .await
        .expect("upload");

    assert_eq!(uploaded.parts, 3);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen.last(), Some(&(10, 10)));
}

#[tokio::test]
async fn test_failed_part_restarts_package_and_completes_once() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, Some(4), Duration::minutes(10)), 2).await;
    Mock::given(method("PUT"))
        .and(path("/storage/roads"))
        .and(header("x-part-number", "2"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_storage_ok(&server).await;
    mount_complete(&server, 1).await;

    let coordinator = UploadCoordinator::new(gateway, &upload_config(3, 1));
    let uploaded = coordinator
        .upload(&package(b"0123456789"), None, &CancellationToken::new(), None)
        .await
        .expect("upload after restart");

    assert_eq!(uploaded.attempts, 2);
    assert_eq!(uploaded.package_id.as_str(), "pkg-1");
}

#[tokio::test]
async fn test_persistent_storage_failure_gives_up() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, None, Duration::minutes(10)), 2).await;
    Mock::given(method("PUT"))
        .and(path("/storage/roads"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    mount_complete(&server, 0).await;

    let coordinator = UploadCoordinator::new(gateway, &upload_config(2, 1));
    let err = coordinator
        .upload(&package(b"0123456789"), None, &CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Failed { attempts: 2, .. }), "got {err:?}");
}

#[tokio::test]
async fn test_expired_parameters_are_refetched_once() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, None, Duration::minutes(-1)), 2).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_complete(&server, 0).await;

    let coordinator = UploadCoordinator::new(gateway, &upload_config(3, 1));
    let err = coordinator
        .upload(&package(b"0123456789"), None, &CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err, UploadError::ParameterExpired);
}

#[tokio::test]
async fn test_storage_expiry_restarts_with_fresh_parameters() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, None, Duration::minutes(10)), 2).await;
    Mock::given(method("PUT"))
        .and(path("/storage/roads"))
        .respond_with(
            ResponseTemplate::new(403).set_body_string("<Error>Request has expired</Error>"),
        )
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_storage_ok(&server).await;
    mount_complete(&server, 1).await;

    let coordinator = UploadCoordinator::new(gateway, &upload_config(1, 1));
    let uploaded = coordinator
        .upload(&package(b"0123456789"), None, &CancellationToken::new(), None)
        .await
        .expect("upload after expiry");

    assert_eq!(uploaded.attempts, 2);
}

#[tokio::test]
async fn test_expired_completion_token_restarts_upload() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, None, Duration::minutes(10)), 2).await;
    mount_storage_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/uploads/complete"))
        .respond_with(ResponseTemplate::new(410).set_body_json(json!({
            "error": {"code": "upload_expired", "message": "Completion token expired"}
        })))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_complete(&server, 1).await;

    let coordinator = UploadCoordinator::new(gateway, &upload_config(3, 1));
    let uploaded = coordinator
        .upload(&package(b"0123456789"), None, &CancellationToken::new(), None)
        .await
        .expect("upload after expired completion");

    assert_eq!(uploaded.attempts, 2);
}

#[tokio::test]
async fn test_cancelled_before_start_makes_no_calls() {
    let (server, gateway) = common::setup_gateway().await;
    mount_parameters(&server, parameters(&server, None, Duration::minutes(10)), 0).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let coordinator = UploadCoordinator::new(gateway, &upload_config(3, 1));
    let err = coordinator
        .upload(&package(b"0123456789"), None, &cancel, None)
        .await
        .unwrap_err();

    assert_eq!(err, UploadError::Cancelled);
}
