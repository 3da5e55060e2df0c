//! HTTP API for meterwatch.
//!
//! Exposes engine state (metrics, breakers, loop status, retention) and a few
//! control endpoints. All bodies are JSON.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::acquisition::{AcquisitionError, Orchestrator};
use crate::device::CircuitStateKind;
use crate::metrics::MetricsCollector;
use crate::retention::RetentionManager;
use crate::storage::db::SqlitePool;
use crate::storage::{DeviceId, DeviceRegistry};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub registry: Arc<dyn DeviceRegistry>,
    pub orchestrator: Orchestrator,
    pub metrics: Arc<MetricsCollector>,
    pub retention: Arc<RetentionManager>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Breaker view of one device.
#[derive(Debug, Serialize)]
pub struct DeviceHealthResponse {
    pub device_id: DeviceId,
    pub name: String,
    pub healthy: bool,
    pub circuit_state: CircuitStateKind,
    pub error_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CircuitResetResponse {
    pub device_id: DeviceId,
    pub circuit_state: CircuitStateKind,
    pub error_count: u32,
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", err)).into_response()
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/metrics/system", get(system_metrics_handler))
        .route("/api/metrics/acquisition", get(acquisition_metrics_handler))
        .route("/api/metrics/throughput", get(throughput_handler))
        .route("/api/metrics/reset", post(metrics_reset_handler))
        .route("/api/circuits", get(circuits_handler))
        .route("/api/devices/{id}/health", get(device_health_handler))
        .route("/api/devices/{id}/metrics", get(device_metrics_handler))
        .route("/api/devices/{id}/poll", post(device_poll_handler))
        .route("/api/devices/{id}/circuit/reset", post(circuit_reset_handler))
        .route("/api/acquisition/status", get(acquisition_status_handler))
        .route("/api/acquisition/start", post(acquisition_start_handler))
        .route("/api/acquisition/stop", post(acquisition_stop_handler))
        .route("/api/retention/cleanup", post(retention_cleanup_handler))
        .route("/api/retention/stats", get(retention_stats_handler))
        .route("/api/retention/history", get(retention_history_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks database availability.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    let db_status = sqlx::query("SELECT 1")
        .execute(state.pool.inner())
        .await
        .map(|_| "ready".to_string())
        .map_err(|e| e.to_string());

    match db_status {
        Ok(db) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some(db),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err),
                }),
            )
                .into_response()
        }
    }
}

async fn system_metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.get_current_metrics())
}

async fn acquisition_metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.get_acquisition_metrics())
}

async fn throughput_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.get_throughput_metrics())
}

/// Zero counters and the latency window; returns the fresh throughput view.
async fn metrics_reset_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.reset();
    Json(state.metrics.get_throughput_metrics())
}

/// Breakers of every device read so far, keyed by device id.
async fn circuits_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.reader().breaker_snapshots())
}

async fn device_metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> Response {
    match state.metrics.device_snapshot(id) {
        Some(metrics) => Json(metrics).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no metrics for device {id}")).into_response(),
    }
}

/// Close a device's breaker so the next cycle reads it normally.
async fn circuit_reset_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> Response {
    match state.registry.get_device(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, format!("device {id} not found")).into_response(),
        Err(e) => return internal_error(e),
    }

    let reader = state.orchestrator.reader();
    reader.reset_circuit(id);
    Json(CircuitResetResponse {
        device_id: id,
        circuit_state: reader.circuit_state(id),
        error_count: reader.error_count(id),
    })
    .into_response()
}

/// Breaker state plus a live probe (skipped while the breaker is open).
async fn device_health_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> Response {
    let device = match state.registry.get_device(id).await {
        Ok(Some(device)) => device,
        Ok(None) => return (StatusCode::NOT_FOUND, format!("device {id} not found")).into_response(),
        Err(e) => return internal_error(e),
    };

    let reader = state.orchestrator.reader();
    let healthy = reader.is_healthy(&device).await;
    let snapshot = reader.breaker_snapshot(id);

    Json(DeviceHealthResponse {
        device_id: id,
        name: device.name,
        healthy,
        circuit_state: reader.circuit_state(id),
        error_count: reader.error_count(id),
        last_error: snapshot.and_then(|s| s.last_error),
    })
    .into_response()
}

async fn device_poll_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DeviceId>,
) -> Response {
    match state.orchestrator.poll_device(id).await {
        Ok(reading) => Json(reading).into_response(),
        Err(AcquisitionError::DeviceNotFound(id)) => {
            (StatusCode::NOT_FOUND, format!("device {id} not found")).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn acquisition_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

async fn acquisition_start_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.orchestrator.resume();
    Json(state.orchestrator.status())
}

async fn acquisition_stop_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.orchestrator.pause();
    Json(state.orchestrator.status())
}

/// Run a sweep immediately, regardless of the schedule.
async fn retention_cleanup_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.retention.run_cleanup_once().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Manual retention sweep failed");
            internal_error(e)
        }
    }
}

async fn retention_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.retention.retention_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn retention_history_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.retention.history())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionConfig;
    use crate::device::{DeviceClient, DeviceError, DeviceReader, RawValues};
    use crate::retention::RetentionConfig;
    use crate::storage::{Device, DeviceRecord, StorageBuilder, StorageHandles, TagMap, TagRecord};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    struct StubMeter;

    #[async_trait::async_trait]
    impl DeviceClient for StubMeter {
        async fn read(&self, _device: &Device, tags: &[TagMap]) -> Result<RawValues, DeviceError> {
            Ok(tags.iter().map(|t| (t.address_key.clone(), Some(230.0))).collect())
        }

        async fn probe(&self, _device: &Device) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    async fn create_test_state() -> (AppState, StorageHandles, TempDir) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("server.db").display());
        let handles = StorageBuilder::new(&url).build().await.unwrap();

        handles
            .devices
            .sync_from_config(&[DeviceRecord {
                id: Some(1),
                name: "meter-1".to_string(),
                address: "10.0.0.1".to_string(),
                protocol: "webmi".to_string(),
                enabled: true,
                poll_interval_ms: None,
                tags: vec![TagRecord {
                    signal: "U12".to_string(),
                    address_key: "U12".to_string(),
                    unit: Some("V".to_string()),
                    scale: 1.0,
                    enabled: true,
                }],
            }])
            .await
            .unwrap();

        let registry: Arc<dyn DeviceRegistry> = Arc::new(handles.devices.clone());
        let reader = Arc::new(DeviceReader::new(Arc::new(StubMeter), registry.clone()));
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
            AcquisitionConfig::default(),
        );
        let retention = Arc::new(RetentionManager::new(
            Arc::new(handles.measurements.clone()),
            RetentionConfig::default(),
        ));

        let state = AppState {
            pool: handles.pool.clone(),
            registry,
            orchestrator,
            metrics,
            retention,
        };
        (state, handles, dir)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into()));
        (status, body)
    }

    #[tokio::test]
    async fn test_probes() {
        let (state, handles, _dir) = create_test_state().await;
        let app = create_router(state);

        let (status, body) = call(&app, "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["db"], "ready");
        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_then_metrics() {
        let (state, handles, _dir) = create_test_state().await;
        let app = create_router(state);

        let (status, body) = call(&app, "POST", "/api/devices/1/poll").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_success"], true);
        assert_eq!(body["measurements"][0]["value"], 230.0);

        let (_, body) = call(&app, "GET", "/api/metrics/acquisition").await;
        assert_eq!(body["devices"][0]["device_id"], 1);
        assert_eq!(body["devices"][0]["status"], "healthy");
        assert_eq!(body["throughput"]["total_points"], 1);

        let (_, body) = call(&app, "GET", "/api/devices/1/health").await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["circuit_state"], "closed");

        let (status, _) = call(&app, "POST", "/api/devices/9/poll").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/devices/9/health").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_circuit_reset_and_metrics_reset() {
        let (state, handles, _dir) = create_test_state().await;
        let reader = state.orchestrator.reader().clone();
        let app = create_router(state);

        let (status, _) = call(&app, "GET", "/api/devices/1/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/api/devices/1/poll").await;
        let (status, body) = call(&app, "GET", "/api/devices/1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success_count"], 1);

        let (_, body) = call(&app, "GET", "/api/circuits").await;
        assert_eq!(body["1"]["state"], "closed");

        let (status, body) = call(&app, "POST", "/api/devices/1/circuit/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["circuit_state"], "closed");
        assert_eq!(body["error_count"], 0);
        assert_eq!(reader.circuit_state(1), CircuitStateKind::Closed);

        let (status, _) = call(&app, "POST", "/api/devices/9/circuit/reset").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "POST", "/api/metrics/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_points"], 0);
        assert_eq!(body["sample_count"], 0);
        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquisition_control() {
        let (state, handles, _dir) = create_test_state().await;
        let app = create_router(state);

        let (_, body) = call(&app, "POST", "/api/acquisition/stop").await;
        assert_eq!(body["running"], false);
        let (_, body) = call(&app, "POST", "/api/acquisition/start").await;
        assert_eq!(body["running"], true);
        let (_, body) = call(&app, "GET", "/api/acquisition/status").await;
        assert_eq!(body["parallelism"], 6);
        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_endpoints() {
        let (state, handles, _dir) = create_test_state().await;
        let app = create_router(state);

        let (status, body) = call(&app, "POST", "/api/retention/cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted_count"], 0);

        let (_, body) = call(&app, "GET", "/api/retention/history").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = call(&app, "GET", "/api/retention/stats").await;
        assert_eq!(body["retention_days"], 10);
        assert_eq!(body["expired_rows"], 0);
        handles.shutdown().await.unwrap();
    }
}
