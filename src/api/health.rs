use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::time::Duration;

use super::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceStatus,
}

#[derive(Serialize)]
pub struct ServiceStatus {
    pub database: bool,
    pub redis: bool,
    pub scan_queue: bool,
    pub analysis_queue: bool,
}

#[derive(Serialize)]
pub struct PingResponse {
    pub status: &'static str,
}

/// Liveness probe: returns 200 immediately, no dependency calls.
pub async fn live() -> Json<PingResponse> {
    Json(PingResponse { status: "ok" })
}

async fn check_database(state: &AppState) -> bool {
    tokio::time::timeout(CHECK_TIMEOUT, sqlx::query("SELECT 1").fetch_one(&state.db))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

async fn check_redis(state: &AppState) -> bool {
    let mut conn = state.redis.clone();
    tokio::time::timeout(
        CHECK_TIMEOUT,
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

/// Full health check: database, Redis and both queues (queue checks ping
/// the backing store and list waiting, bounded at 5 s each).
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = check_database(&state).await;
    let redis = check_redis(&state).await;
    let scan_queue = state.scan_queue.health_check().await.is_ok();
    let analysis_queue = state.analysis_queue.health_check().await.is_ok();

    let all_healthy = database && redis && scan_queue && analysis_queue;
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if all_healthy {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceStatus {
                database,
                redis,
                scan_queue,
                analysis_queue,
            },
        }),
    )
}

/// Readiness probe: the API can serve traffic when its stores respond.
pub async fn ready(State(state): State<AppState>) -> StatusCode {
    if check_database(&state).await && check_redis(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Queue metrics snapshots as JSON.
pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let scan_counts = state.scan_queue.counts().await.unwrap_or_default();
    let analysis_counts = state.analysis_queue.counts().await.unwrap_or_default();

    Json(serde_json::json!({
        "queues": {
            "scan": state.scan_queue.metrics_snapshot(scan_counts),
            "analysis": state.analysis_queue.metrics_snapshot(analysis_counts),
        }
    }))
}
