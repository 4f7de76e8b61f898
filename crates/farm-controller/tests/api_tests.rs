//! Integration tests for the controller API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use farm_controller::api::{create_router, AppState};
use farm_lib::{
    cluster::{PoolId, SimulatedCluster, SimulationConfig},
    controller::{ControllerOptions, ControllerParts, DesiredState, FarmController},
    cost::ActiveHours,
    decision_log::DecisionLog,
    health::{components, HealthRegistry},
    image::InMemoryRegistry,
    monitor::{HealthSnapshot, InstanceRegistry},
    ClusterPool, DiskProfile, FarmMetrics, MachineProfile, StructuredLogger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_test::assert_ok;
use tower::ServiceExt;

const IMAGE: &str = "registry.local/ci/jenkins:lts";

fn pool() -> ClusterPool {
    ClusterPool {
        name: "ci-pool".to_string(),
        zone: "us-central1-a".to_string(),
        node_count: 0,
        min_nodes: 0,
        max_nodes: 2,
        machine_profile: MachineProfile {
            machine_type: "e2-standard-2".to_string(),
            allocatable_cpu_millicores: 1930,
            allocatable_memory_bytes: 6 << 30,
            preemptible: false,
            hourly_cost: 0.067,
        },
        disk_profile: DiskProfile {
            disk_type: "pd-standard".to_string(),
            size_gb: 30,
        },
    }
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    _health_tx: watch::Sender<HealthSnapshot>,
    _alert_tx: mpsc::Sender<farm_lib::monitor::HealthAlert>,
}

async fn setup_test_app() -> TestApp {
    let cluster = Arc::new(SimulatedCluster::new(SimulationConfig {
        claim_bind_delay: Duration::ZERO,
        resize_delay: Duration::ZERO,
        replica_ready_delay: Duration::ZERO,
        bind_claims: true,
    }));
    cluster.seed_pool(pool());
    let images = Arc::new(InMemoryRegistry::new());
    images.add_local(IMAGE, b"jenkins");
    let (health_tx, health) = watch::channel(HealthSnapshot::default());
    let (alert_tx, alerts) = mpsc::channel(8);

    let desired = DesiredState {
        image: IMAGE.to_string(),
        max_nodes: 2,
        active_hours: ActiveHours::never(),
        ..Default::default()
    };
    let controller = FarmController::new(
        ControllerOptions::new(PoolId::new("us-central1-a", "ci-pool")),
        desired,
        ControllerParts {
            cluster,
            image_source: images.clone(),
            registry: images,
            instances: Arc::new(InstanceRegistry::new()),
            health,
            alerts,
            decisions: DecisionLog::in_memory(),
        },
        HealthRegistry::for_controller().await,
        StructuredLogger::new("us-central1-a/ci-pool"),
    )
    .unwrap();

    let state = Arc::new(AppState::new(Arc::new(controller), FarmMetrics::new()));
    TestApp {
        router: create_router(state.clone()),
        state,
        _health_tx: health_tx,
        _alert_tx: alert_tx,
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn send_json(
    router: Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
}

/// Run cycles one simulated minute apart after an activity signal
async fn converge(app: &TestApp) {
    let base = Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap();
    app.state.controller.record_activity(base).await;
    for minute in 0..5 {
        let now = base + chrono::Duration::minutes(minute);
        assert_ok!(app.state.controller.reconcile_once(now).await);
    }
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app().await;
    let (status, health) = get(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app().await;

    app.state
        .controller
        .health_registry()
        .set_degraded(components::STORAGE, "claim pending for 240s")
        .await;

    let (status, health) = get(app.router, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;

    app.state
        .controller
        .health_registry()
        .set_unhealthy(components::IMAGE, "registry rejected credentials")
        .await;

    let (status, health) = get(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(
        health["components"]["image"]["message"],
        "registry rejected credentials"
    );
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let app = setup_test_app().await;
    let (_, health) = get(app.router, "/healthz").await;

    assert!(health["components"].is_object());
    for name in components::ALL {
        assert!(health["components"][name].is_object(), "missing {}", name);
    }
}

#[tokio::test]
async fn test_readyz_returns_503_before_first_cycle() {
    let app = setup_test_app().await;
    let (status, readiness) = get(app.router, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_after_cycle() {
    let app = setup_test_app().await;
    converge(&app).await;

    let (status, readiness) = get(app.router, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let app = setup_test_app().await;
    converge(&app).await;

    let response = app
        .router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("farm_controller_reconcile_latency_seconds_bucket"));
    assert!(metrics_text.contains("farm_controller_pool_node_count"));
    assert!(metrics_text.contains("farm_controller_cost_decisions_total"));
}

#[tokio::test]
async fn test_status_reports_phase() {
    let app = setup_test_app().await;

    let (status, body) = get(app.router.clone(), "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "starting");
    assert_eq!(body["pool"], "us-central1-a/ci-pool");

    converge(&app).await;
    let (_, body) = get(app.router, "/api/v1/status").await;
    assert_eq!(body["phase"], "available");
    assert_eq!(body["node_count"], 1);
    assert_eq!(body["volume_state"], "bound");
    assert_eq!(body["last_decision"]["target_node_count"], 1);
    assert!(body["last_error"].is_null());
}

#[tokio::test]
async fn test_decisions_respects_limit() {
    let app = setup_test_app().await;
    converge(&app).await;

    let (status, body) = get(app.router.clone(), "/api/v1/decisions?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["reason"], "recent activity signal");

    let (_, all) = get(app.router, "/api/v1/decisions").await;
    assert!(!all.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_put_desired_applies_patch() {
    let app = setup_test_app().await;

    let (status, body) = send_json(
        app.router.clone(),
        "PUT",
        "/api/v1/desired",
        serde_json::json!({"replicas": 2, "max_nodes": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replicas"], 2);

    let (_, desired) = get(app.router, "/api/v1/desired").await;
    assert_eq!(desired["replicas"], 2);
    assert_eq!(desired["image"], IMAGE);
}

#[tokio::test]
async fn test_put_desired_rejects_invalid_state() {
    let app = setup_test_app().await;

    let (status, body) = send_json(
        app.router.clone(),
        "PUT",
        "/api/v1/desired",
        serde_json::json!({"min_nodes": 3, "max_nodes": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("min_nodes"));

    let (status, _) = send_json(app.router, "PUT", "/api/v1/desired", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.state.controller.desired().await.max_nodes, 2);
}

#[tokio::test]
async fn test_put_desired_rejects_oversized_replica_count() {
    let app = setup_test_app().await;

    let (status, body) = send_json(
        app.router.clone(),
        "PUT",
        "/api/v1/desired",
        serde_json::json!({"replicas": u32::MAX}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("replicas"));

    // The controller keeps reconciling the previous state
    converge(&app).await;
    assert_eq!(app.state.controller.desired().await.replicas, 1);
    let (_, status) = get(app.router, "/api/v1/status").await;
    assert_eq!(status["phase"], "available");
}

#[tokio::test]
async fn test_activity_is_recorded() {
    let app = setup_test_app().await;

    let (status, body) = send_json(
        app.router.clone(),
        "POST",
        "/api/v1/activity",
        serde_json::json!({"at": "2024-01-06T09:30:00Z", "source": "build-queue"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["recorded_at"], "2024-01-06T09:30:00Z");
    assert_eq!(
        app.state.controller.last_activity().await,
        Some(Utc.with_ymd_and_hms(2024, 1, 6, 9, 30, 0).unwrap())
    );

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/activity")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(app.state.controller.last_activity().await.unwrap() > Utc.with_ymd_and_hms(2024, 1, 6, 9, 30, 0).unwrap());
}
