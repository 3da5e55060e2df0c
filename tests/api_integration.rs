//! End-to-end tests for meterwatch.
//!
//! A fake WebMI meter is served over real HTTP, the fleet is synced into a
//! SQLite registry, and the engine is driven through the public API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Form, Json, Router, routing::post};
use http_body_util::BodyExt;
use meterwatch::acquisition::{AcquisitionConfig, Orchestrator};
use meterwatch::device::{CircuitBreakerConfig, CircuitStateKind, DeviceReader, WebMiClient};
use meterwatch::metrics::MetricsCollector;
use meterwatch::retention::{RetentionConfig, RetentionManager};
use meterwatch::server::{AppState, create_router};
use meterwatch::storage::{DeviceRecord, DeviceRegistry, StorageBuilder, StorageHandles, TagRecord};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

// =============================================================================
// Test Helpers
// =============================================================================

/// Fake meter answering every key with 4000.0 except `MISSING`.
async fn fake_meter(body: Form<Vec<(String, String)>>) -> Json<Value> {
    let result: Vec<Value> = body
        .0
        .iter()
        .map(|(_, key)| match key.as_str() {
            "MISSING" => json!({"value": null, "error": 1}),
            _ => json!({"value": 4000.0, "error": 0}),
        })
        .collect();
    Json(json!({ "result": result, "error": 0 }))
}

async fn start_fake_meter() -> String {
    let router = Router::new().route("/webMI/", post(fake_meter));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr.to_string()
}

fn tag(signal: &str, key: &str, scale: f64) -> TagRecord {
    TagRecord {
        signal: signal.to_string(),
        address_key: key.to_string(),
        unit: None,
        scale,
        enabled: true,
    }
}

fn device(id: i64, name: &str, address: &str) -> DeviceRecord {
    DeviceRecord {
        id: Some(id),
        name: name.to_string(),
        address: address.to_string(),
        protocol: "webmi".to_string(),
        enabled: true,
        poll_interval_ms: None,
        tags: vec![tag("I_PH1", "I1", 1000.0), tag("U12", "MISSING", 1.0)],
    }
}

struct Engine {
    state: AppState,
    handles: StorageHandles,
    _dir: TempDir,
}

/// Storage on a temp file, one live meter (id 1) and one unreachable meter (id 2).
async fn start_engine() -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("e2e.db").display());
    let handles = StorageBuilder::new(&url)
        .build()
        .await
        .expect("Failed to build storage");

    let meter = start_fake_meter().await;
    handles
        .devices
        .sync_from_config(&[device(1, "live", &meter), device(2, "dead", "127.0.0.1:1")])
        .await
        .unwrap();

    let registry: Arc<dyn DeviceRegistry> = Arc::new(handles.devices.clone());
    let client = WebMiClient::new(Duration::from_millis(500)).unwrap();
    let reader = Arc::new(
        DeviceReader::new(Arc::new(client), registry.clone())
            .with_read_timeout(Duration::from_millis(500))
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
                ..Default::default()
            }),
    );
    let metrics = Arc::new(
        MetricsCollector::new()
            .with_reader(reader.clone())
            .with_writer(handles.writer.clone()),
    );
    let orchestrator = Orchestrator::new(
        registry.clone(),
        reader,
        handles.writer.clone(),
        metrics.clone(),
        AcquisitionConfig {
            default_poll_interval_ms: 10,
            jitter_pct: 0.0,
            ..Default::default()
        },
    );
    let retention = Arc::new(RetentionManager::new(
        Arc::new(handles.measurements.clone()),
        RetentionConfig::default(),
    ));

    Engine {
        state: AppState {
            pool: handles.pool.clone(),
            registry,
            orchestrator,
            metrics,
            retention,
        },
        handles,
        _dir: dir,
    }
}

async fn run_cycles(orchestrator: &Orchestrator, n: usize) {
    for _ in 0..n {
        orchestrator.run_cycle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

/// Start the API server and return its base URL.
async fn serve(state: AppState) -> String {
    let router = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

// =============================================================================
// Acquisition
// =============================================================================

#[tokio::test]
async fn test_cycles_persist_and_isolate_dead_meter() {
    let engine = start_engine().await;
    let orchestrator = &engine.state.orchestrator;

    run_cycles(orchestrator, 3).await;

    let reader = orchestrator.reader();
    assert_eq!(reader.circuit_state(1), CircuitStateKind::Closed);
    assert_eq!(reader.circuit_state(2), CircuitStateKind::Open);
    assert_eq!(reader.error_count(2), 2);

    engine.handles.writer.flush().await.unwrap();
    let rows = engine.handles.measurements.latest_for_device(1, 100).await.unwrap();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().any(|m| m.signal == "I_PH1" && m.value == 4.0));
    assert!(rows.iter().any(|m| m.signal == "U12" && m.value == 0.0));
    assert!(engine.handles.measurements.latest_for_device(2, 10).await.unwrap().is_empty());

    let live = engine.state.registry.get_device(1).await.unwrap().unwrap();
    assert!(live.last_seen.is_some());
    let dead = engine.state.registry.get_device(2).await.unwrap().unwrap();
    assert!(dead.last_seen.is_none());

    engine.handles.shutdown().await.unwrap();
}

// =============================================================================
// HTTP API
// =============================================================================

#[tokio::test]
async fn test_api_over_http() {
    let engine = start_engine().await;
    run_cycles(&engine.state.orchestrator, 2).await;
    let base_url = serve(engine.state.clone()).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/readyz", base_url)).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = client
        .get(format!("{}/api/metrics/acquisition", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let devices = body["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["status"], "healthy");
    assert_eq!(devices[1]["status"], "unknown");
    assert_eq!(devices[1]["circuit_state"], "open");
    assert_eq!(body["throughput"]["total_points"], 4);

    let body: Value = client
        .get(format!("{}/api/devices/2/health", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["healthy"], false);
    assert_eq!(body["error_count"], 2);
    assert!(body["last_error"].as_str().unwrap().contains("transport"));

    let body: Value = client
        .get(format!("{}/api/metrics/system", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["successful_readings"], 2);
    assert_eq!(body["failed_readings"], 2);
    assert!(body["queue"]["max_buffer_size"].as_u64().unwrap() > 0);

    engine.handles.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_poll_and_retention_via_router() {
    let engine = start_engine().await;
    let app = create_router(engine.state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/devices/1/poll")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let reading: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reading["is_success"], true);
    assert_eq!(reading["measurements"].as_array().unwrap().len(), 2);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/retention/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let stats: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(stats["deleted_count"], 0);
    assert_eq!(stats["completed"], true);

    engine.handles.shutdown().await.unwrap();
}
