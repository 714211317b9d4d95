//! Integration tests for the meter API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use meter_lib::{
    api::{create_router, AppState},
    health::{components, HealthRegistry},
    observability::MeterMetrics,
    registry::{ContainerRegistry, TrackingPolicy},
    ContainerInfo,
};
use std::sync::Arc;
use tower::ServiceExt;

const TRACK_LABEL: &str = "com.usage-meter.track";

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::REPORTER).await;

    let registry = Arc::new(ContainerRegistry::new(TrackingPolicy::new(TRACK_LABEL, "")));
    let state = Arc::new(AppState::new(health_registry, registry));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["collector"].is_object());
    assert!(health["components"]["reporter"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::REPORTER, "report rejected")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["reporter"]["message"],
        "report rejected"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::COLLECTOR, "sample channel closed")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_discovery_completes() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "Meter not yet initialized");
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
    assert!(readiness.get("reason").is_none());
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::COLLECTOR, "Failed")
        .await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["reason"], "Unhealthy components: collector");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let metrics = MeterMetrics::new();
    metrics.inc_messages("container_discovery");
    metrics.inc_filter_errors("reporter");
    metrics.observe_report_sent(0.02);
    metrics.set_containers_tracked(3);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("meter_agent_messages_total"));
    assert!(metrics_text.contains("meter_agent_filter_errors_total"));
    assert!(metrics_text.contains("meter_agent_containers_tracked"));
    assert!(metrics_text.contains("meter_agent_report_latency_seconds_bucket"));
    assert!(metrics_text.contains("meter_agent_report_latency_seconds_count"));
}

#[tokio::test]
async fn test_containers_lists_tracked_containers_by_name() {
    let (app, state) = setup_test_app().await;

    for name in ["web", "api"] {
        let info = ContainerInfo::new(name)
            .with_label(TRACK_LABEL, "true")
            .with_image("nginx", "1.25");
        state.registry.register(Arc::new(info)).unwrap();
    }

    let (status, body) = get(app, "/containers").await;
    assert_eq!(status, StatusCode::OK);

    let containers: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let names: Vec<&str> = containers
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["api", "web"]);
    assert_eq!(containers[0]["image_name"], "nginx");
    assert_eq!(containers[0]["labels"][TRACK_LABEL], "true");
}

#[tokio::test]
async fn test_containers_empty_registry() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/containers").await;
    assert_eq!(status, StatusCode::OK);

    let containers: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(containers, serde_json::json!([]));
}
