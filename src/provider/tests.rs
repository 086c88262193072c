//! Tests for the REST provider adapter against an in-process server.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get};
use axum::{Json, Router};
use rstest::rstest;
use serde_json::{Value, json};

use super::*;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("listener addr: {err}"));
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

fn provider(base_url: String, request_timeout: Duration) -> HttpProvider {
    HttpProvider::new(HttpProviderConfig {
        base_url,
        token: String::from("secret-token"),
        request_timeout,
        min_spacing: Duration::ZERO,
        max_in_flight: 4,
    })
    .unwrap_or_else(|err| panic!("provider should build: {err}"))
}

fn instance_json(id: &str, status: &str, label: &str) -> Value {
    json!({
        "id": id,
        "status": status,
        "public_host": "10.0.0.7",
        "port": 8188,
        "label": label,
        "created_at": 1_700_000_000
    })
}

#[rstest]
#[case("running", InstanceStatus::Running)]
#[case("RUNNING", InstanceStatus::Running)]
#[case("pending", InstanceStatus::Requesting)]
#[case("loading", InstanceStatus::Provisioning)]
#[case("exited", InstanceStatus::Stopped)]
#[case("error", InstanceStatus::Failed)]
fn status_from_wire_maps_provider_values(#[case] raw: &str, #[case] expected: InstanceStatus) {
    assert_eq!(InstanceStatus::from_wire(raw), expected);
}

#[tokio::test]
async fn list_offers_decodes_catalog() {
    let app = Router::new().route(
        "/offers",
        get(|| async {
            Json(json!({
                "offers": [
                    {"id": "o-1", "price_per_hour": 0.4, "gpu_memory_gb": 24,
                     "compute_class": "rtx4090", "reliability": 0.99},
                    {"id": "o-2", "price_per_hour": 1.2, "gpu_memory_gb": 80}
                ]
            }))
        }),
    );
    let base = serve(app).await;

    let offers = provider(base, Duration::from_secs(5))
        .list_offers()
        .await
        .unwrap_or_else(|err| panic!("offers: {err}"));

    assert_eq!(offers.len(), 2);
    assert_eq!(offers.first().map(|o| o.id.as_str()), Some("o-1"));
    assert_eq!(offers.get(1).map(|o| o.reliability), Some(0.0));
}

#[tokio::test]
async fn provision_sends_label_and_bearer_token() {
    let app = Router::new().route(
        "/instances",
        axum::routing::post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            let authorised = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                == Some("Bearer secret-token");
            if !authorised {
                return (StatusCode::UNAUTHORIZED, Json(json!({"error": "auth"})));
            }
            let label = body
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            (
                StatusCode::CREATED,
                Json(json!({"instance": {"id": "i-9", "status": "pending", "label": label}})),
            )
        }),
    );
    let base = serve(app).await;
    let request = ProvisionRequest {
        offer_id: String::from("o-1"),
        label: String::from("spotrun-abc"),
        bootstrap: String::from("#!/bin/sh\n"),
    };

    let instance = provider(base, Duration::from_secs(5))
        .provision(&request)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert_eq!(instance.id, "i-9");
    assert_eq!(instance.status, InstanceStatus::Requesting);
    assert_eq!(instance.label.as_deref(), Some("spotrun-abc"));
    assert!(instance.address.is_none());
}

#[tokio::test]
async fn describe_exposes_address_once_running() {
    let app = Router::new().route(
        "/instances/{id}",
        get(|Path(id): Path<String>| async move {
            Json(json!({"instance": instance_json(&id, "running", "spotrun-x")}))
        }),
    );
    let base = serve(app).await;

    let instance = provider(base, Duration::from_secs(5))
        .describe("i-1")
        .await
        .unwrap_or_else(|err| panic!("describe: {err}"));

    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(
        instance.address.map(|addr| addr.base_url()),
        Some(String::from("http://10.0.0.7:8188"))
    );
}

#[tokio::test]
async fn missing_instance_maps_to_not_found() {
    let app = Router::new().route(
        "/instances/{id}",
        delete(|| async { StatusCode::NOT_FOUND }).get(|| async { StatusCode::NOT_FOUND }),
    );
    let base = serve(app).await;
    let adapter = provider(base, Duration::from_secs(5));

    let describe = adapter.describe("gone").await;
    let destroy = adapter.destroy("gone").await;

    let expected = ProviderError::NotFound {
        instance_id: String::from("gone"),
    };
    assert_eq!(describe, Err(expected.clone()));
    assert_eq!(destroy, Err(expected));
}

#[tokio::test]
async fn list_instances_keeps_only_matching_labels() {
    let app = Router::new().route(
        "/instances",
        get(|Query(params): Query<HashMap<String, String>>| async move {
            let label = params.get("label").cloned().unwrap_or_default();
            Json(json!({
                "instances": [
                    instance_json("i-1", "running", &label),
                    instance_json("i-2", "running", "someone-else")
                ]
            }))
        }),
    );
    let base = serve(app).await;

    let instances = provider(base, Duration::from_secs(5))
        .list_instances("spotrun-run-7")
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));

    let ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["i-1"]);
}

#[tokio::test]
async fn rejected_create_surfaces_status_and_body() {
    let app = Router::new().route(
        "/instances",
        axum::routing::post(|| async { (StatusCode::CONFLICT, "offer no longer available") }),
    );
    let base = serve(app).await;
    let request = ProvisionRequest {
        offer_id: String::from("o-1"),
        label: String::from("spotrun-abc"),
        bootstrap: String::new(),
    };

    let err = provider(base, Duration::from_secs(5))
        .provision(&request)
        .await
        .expect_err("conflict should fail");

    assert_eq!(
        err,
        ProviderError::Api {
            status: 409,
            body: String::from("offer no longer available"),
        }
    );
}

#[tokio::test]
async fn slow_create_is_reported_as_ambiguous() {
    let app = Router::new().route(
        "/instances",
        axum::routing::post(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Json(json!({"instance": {"id": "late", "status": "pending"}}))
        }),
    );
    let base = serve(app).await;
    let request = ProvisionRequest {
        offer_id: String::from("o-1"),
        label: String::from("spotrun-abc"),
        bootstrap: String::new(),
    };

    let err = provider(base, Duration::from_millis(50))
        .provision(&request)
        .await
        .expect_err("timeout should fail");

    assert!(
        matches!(err, ProviderError::Ambiguous { .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn refused_connection_is_reported_as_connect() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("listener addr: {err}"));
    drop(listener);

    let err = provider(format!("http://{addr}"), Duration::from_secs(2))
        .list_offers()
        .await
        .expect_err("closed port should fail");

    assert!(
        matches!(err, ProviderError::Connect { .. }),
        "unexpected error: {err}"
    );
}
