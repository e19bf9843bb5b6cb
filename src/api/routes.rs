use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use super::AppState;
use super::{analytics, health, scans};
use crate::middleware::dedup::inflight_dedup_middleware;
use crate::middleware::rate_limit::rate_limit_middleware;

/// Scan pipeline API
///
/// ## Scans
/// - POST   /api/scans                      - Create scan (SSRF policy + per-URL cooldown)
/// - GET    /api/scans                      - List scans (newest first, offset pagination)
/// - GET    /api/scans/by-url/last-good     - Latest non-partial completed scan for a URL
/// - GET    /api/scans/{id}                 - Scan header
/// - GET    /api/scans/{id}/status          - Status + progress + stage (queue overlay)
/// - GET    /api/scans/{id}/results         - Joined results with summary + diagnostics
/// - GET    /api/scans/{id}/surface         - Findings bucketed by category
/// - DELETE /api/scans/{id}                 - Delete scan (artifact purge + cascade)
///
/// ## Analytics
/// - GET    /api/analytics/summary          - Dashboard metrics
///
/// ## Operational (outside /api, no rate limit)
/// - GET    /health  /ready  /live  /metrics
pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/scans", post(scans::create_scan))
        .route("/scans", get(scans::list_scans))
        .route("/scans/by-url/last-good", get(scans::get_last_good_scan))
        .route("/scans/{id}", get(scans::get_scan))
        .route("/scans/{id}", delete(scans::delete_scan))
        .route("/scans/{id}/status", get(scans::get_scan_status))
        .route("/scans/{id}/results", get(scans::get_scan_results))
        .route("/scans/{id}/surface", get(scans::get_scan_surface))
        .route("/analytics/summary", get(analytics::get_summary))
        // Dedup sits inside the rate limit so collapsed requests still count
        // against the caller's window.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inflight_dedup_middleware,
        ))
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware))
}

pub fn operational_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/live", get(health::live))
        .route("/metrics", get(health::metrics))
}
