use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::AppState;
use crate::db;
use crate::db::results::ResultCounts;
use crate::db::scans::ScanRow;
use crate::error::{ApiError, AppError, ErrorResponse};
use crate::models::{Finding, FindingType, Library, ScanParameters, ScanStatus, Severity};
use crate::queue::{JobSpec, JobState};
use crate::security;
use crate::storage;
use crate::worker::tasks::ScanTask;

// ============================================
// Constants
// ============================================

/// Create-scan request bodies above this are rejected.
const MAX_CREATE_BODY_BYTES: usize = 1024 * 1024;

/// Maximum JSON nesting depth accepted in request bodies.
const MAX_JSON_DEPTH: usize = 10;

/// Maximum length of any string value in a request body.
const MAX_STRING_LENGTH: usize = 1000;

// ============================================
// Request/Response Types
// ============================================

#[derive(Debug, Deserialize, Validate)]
struct CreateScanRequest {
    #[validate(length(min = 1, max = 1000))]
    url: String,
    #[serde(default)]
    parameters: Option<ScanParameters>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScanResponse {
    pub id: Uuid,
    pub status: ScanStatus,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListScansParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct ListScansResponse {
    pub scans: Vec<ScanRow>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: ScanStatus,
    pub progress: u8,
    pub stage: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSummary {
    pub total_libraries: usize,
    pub total_findings: usize,
    pub total_vulnerabilities: usize,
    pub global_risk_score: i32,
    pub risk_level: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub partial_scan: bool,
    pub quality_score: i32,
    pub scripts_analyzed: i64,
    pub libraries_detected: i64,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub scan: ScanRow,
    pub libraries: Vec<Library>,
    pub findings: Vec<Finding>,
    pub summary: ResultsSummary,
    pub diagnostics: Diagnostics,
}

// ============================================
// Payload validation
// ============================================

/// Depth of a JSON value; scalars are depth 1.
fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => {
            1 + items.iter().map(json_depth).max().unwrap_or(0)
        }
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        _ => 1,
    }
}

/// Strip ASCII control characters from every string in the payload.
fn strip_control_chars(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if s.chars().any(|c| c.is_control()) {
                *s = s.chars().filter(|c| !c.is_control()).collect();
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_control_chars(item);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                strip_control_chars(item);
            }
        }
        _ => {}
    }
}

fn longest_string(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::String(s) => s.len(),
        serde_json::Value::Array(items) => items.iter().map(longest_string).max().unwrap_or(0),
        serde_json::Value::Object(map) => map.values().map(longest_string).max().unwrap_or(0),
        _ => 0,
    }
}

/// Structural request body checks: size, nesting depth, string lengths.
/// Control characters are stripped in place rather than rejected. Each
/// failure keeps its own stable code: oversized bodies are
/// `PAYLOAD_TOO_LARGE`, structural problems are `VALIDATION_ERROR`.
fn validate_payload(value: &mut serde_json::Value, raw_len: usize) -> Result<(), AppError> {
    if raw_len > MAX_CREATE_BODY_BYTES {
        return Err(AppError::PayloadTooLarge(format!(
            "request body exceeds {} bytes",
            MAX_CREATE_BODY_BYTES
        )));
    }
    if json_depth(value) > MAX_JSON_DEPTH {
        return Err(AppError::Validation(format!(
            "request body nesting exceeds {} levels",
            MAX_JSON_DEPTH
        )));
    }
    strip_control_chars(value);
    if longest_string(value) > MAX_STRING_LENGTH {
        return Err(AppError::Validation(format!(
            "string values must be at most {} characters",
            MAX_STRING_LENGTH
        )));
    }
    Ok(())
}

// ============================================
// Cooldown (pure)
// ============================================

/// Seconds a caller must wait before re-scanning a URL, given the previous
/// scan's creation time. None when the cooldown has passed.
pub fn cooldown_remaining(
    previous_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    cooldown_seconds: u64,
) -> Option<u64> {
    let elapsed = (now - previous_created_at).num_seconds().max(0) as u64;
    if elapsed < cooldown_seconds {
        Some(cooldown_seconds - elapsed)
    } else {
        None
    }
}

// ============================================
// Status overlay (pure)
// ============================================

/// Queue-side view of a scan job, as far as the status endpoint cares.
#[derive(Debug, Clone, Copy)]
pub struct QueueView {
    pub state: JobState,
    pub progress: u8,
    /// Worker-reported success for completed jobs.
    pub success: Option<bool>,
}

/// Overlay queue state onto the DB status:
/// waiting|delayed|active => running; completed with success=false =>
/// failed; completed => completed; failed|dead-letter => failed. Terminal
/// DB states win (scans are immutable once completed).
pub fn overlay_status(db_status: ScanStatus, queue: Option<&QueueView>) -> (ScanStatus, u8) {
    if db_status.is_terminal() {
        return (db_status, 100);
    }

    match queue {
        None => (db_status, 0),
        Some(view) => match view.state {
            JobState::Waiting | JobState::Delayed | JobState::Active => {
                (ScanStatus::Running, view.progress)
            }
            JobState::Completed => match view.success {
                Some(false) => (ScanStatus::Failed, 100),
                _ => (ScanStatus::Completed, 100),
            },
            JobState::Failed | JobState::DeadLetter => (ScanStatus::Failed, view.progress.max(1)),
        },
    }
}

/// UX stage label derived from the progress value.
pub fn stage_for_progress(progress: u8) -> &'static str {
    match progress {
        0..=9 => "initializing",
        10..=39 => "rendering",
        40..=69 => "fetching_scripts",
        70..=84 => "dispatching_analysis",
        85..=94 => "analyzing",
        _ => "saving_results",
    }
}

// ============================================
// Results diagnostics (pure)
// ============================================

pub fn compute_diagnostics(counts: ResultCounts) -> Diagnostics {
    let partial_scan = (counts.scripts > 0 && counts.libraries == 0)
        || (counts.scripts > 100 && counts.libraries <= 2);

    let mut quality: i32 = 100;
    if partial_scan {
        quality -= 40;
    }
    if counts.scripts < 10 {
        quality -= 20;
    }
    if counts.libraries == 0 {
        quality -= 40;
    }

    Diagnostics {
        partial_scan,
        quality_score: quality.clamp(0, 100),
        scripts_analyzed: counts.scripts,
        libraries_detected: counts.libraries,
    }
}

// ============================================
// Handlers
// ============================================

/// Create a scan: validate, apply the SSRF policy and the per-URL cooldown,
/// insert the pending row and enqueue the render job.
pub async fn create_scan(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<CreateScanResponse>), ApiError> {
    let raw_len = body.len();
    let mut payload: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| ApiError::from(AppError::Serialization(e)))?;
    validate_payload(&mut payload, raw_len).map_err(ApiError::from)?;

    let request: CreateScanRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::from(AppError::Validation(format!("invalid request: {}", e))))?;
    request
        .validate()
        .map_err(|e| ApiError::from(AppError::Validation(e.to_string())))?;

    // SSRF policy, including DNS resolution of the host.
    let target = security::validate_target_url(&request.url)
        .await
        .map_err(ApiError::from)?;
    let url = target.to_string();

    // Per-URL cooldown against the most recent scan of the same URL.
    let cooldown = state.config.scan_url_cooldown_seconds;
    if cooldown > 0 {
        let recent = db::with_retry("recent-scan-for-url", || {
            db::scans::most_recent_scan_for_url(&state.db, &url)
        })
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;

        if let Some(previous) = recent {
            if let Some(retry_after_seconds) =
                cooldown_remaining(previous.created_at, Utc::now(), cooldown)
            {
                return Err(ApiError::from(AppError::Cooldown {
                    retry_after_seconds,
                }));
            }
        }
    }

    let parameters = request.parameters.unwrap_or_default();
    let scan_id = Uuid::new_v4();
    let scan = db::with_retry("create-scan", || {
        db::scans::create_scan(&state.db, scan_id, &url, &parameters)
    })
    .await
    .map_err(|e| ApiError::from(AppError::Database(e)))?;

    let task = ScanTask {
        scan_id,
        url: url.clone(),
        parameters,
    };
    let payload = serde_json::to_value(&task)
        .map_err(|e| ApiError::from(AppError::Internal(e.into())))?;
    state
        .scan_queue
        .enqueue(
            JobSpec::new(scan_id.to_string(), payload)
                .max_attempts(state.config.queue_max_attempts)
                .backoff_base_ms(state.config.queue_retry_delay)
                .timeout_ms(state.config.queue_job_timeout),
        )
        .await
        .map_err(|e| ApiError::from(AppError::Queue(e.to_string())))?;

    tracing::info!("Scan {} created for {}", scan_id, url);

    Ok((
        StatusCode::CREATED,
        Json(CreateScanResponse {
            id: scan.id,
            status: scan.status,
            url: scan.url,
            created_at: scan.created_at,
        }),
    ))
}

pub async fn list_scans(
    State(state): State<AppState>,
    Query(params): Query<ListScansParams>,
) -> Result<Json<ListScansResponse>, ApiError> {
    let limit = params.limit.clamp(1, 100);
    let offset = params.offset.max(0);

    let (scans, total) = db::with_retry("list-scans", || {
        db::scans::list_scans(&state.db, limit, offset)
    })
    .await
    .map_err(|e| ApiError::from(AppError::Database(e)))?;

    Ok(Json(ListScansResponse {
        scans,
        total,
        limit,
        offset,
    }))
}

async fn load_scan(state: &AppState, id: Uuid) -> Result<ScanRow, ApiError> {
    db::with_retry("get-scan", || db::scans::get_scan(&state.db, id))
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("Scan not found", "NOT_FOUND")),
            )
        })
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanRow>, ApiError> {
    Ok(Json(load_scan(&state, id).await?))
}

/// Scan status with the queue state overlaid on the DB row. When the
/// overlay produces a different terminal-or-running status, it is written
/// back conditionally (CAS on the observed status).
pub async fn get_scan_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let scan = load_scan(&state, id).await?;

    let queue_view = match state.scan_queue.get_job(&id.to_string()).await {
        Ok(Some(job)) => Some(QueueView {
            state: job.state,
            progress: job.progress,
            success: job.result.as_ref().map(|r| r.success),
        }),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("Queue lookup for scan {} failed: {}", id, e);
            None
        }
    };

    let (status, progress) = overlay_status(scan.status, queue_view.as_ref());

    let mut error = scan.error.clone();
    if status != scan.status && (status.is_terminal() || status == ScanStatus::Running) {
        let overlay_error = match (status, &queue_view) {
            (ScanStatus::Failed, Some(view)) if view.state == JobState::Completed => {
                Some("Scan worker reported failure".to_string())
            }
            _ => None,
        };
        match db::scans::reconcile_status(
            &state.db,
            id,
            scan.status,
            status,
            overlay_error.as_deref(),
        )
        .await
        {
            Ok(true) => {
                tracing::info!(
                    "Reconciled scan {} status {} -> {}",
                    id,
                    scan.status.as_str(),
                    status.as_str()
                );
                if error.is_none() {
                    error = overlay_error;
                }
            }
            Ok(false) => {
                // A worker won the race; its write stands.
            }
            Err(e) => tracing::warn!("Status reconciliation for {} failed: {}", id, e),
        }
    }

    Ok(Json(StatusResponse {
        id,
        status,
        progress,
        stage: stage_for_progress(progress),
        started_at: scan.started_at,
        completed_at: scan.completed_at,
        error,
    }))
}

pub async fn get_scan_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let scan = load_scan(&state, id).await?;

    let libraries = db::results::fetch_libraries(&state.db, id)
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;
    let findings = db::results::fetch_findings(&state.db, id)
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;
    let counts = db::results::result_counts(&state.db, id)
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;

    let total_vulnerabilities: usize = libraries.iter().map(|l| l.vulnerabilities.len()).sum();
    let global = scan.global_risk_score.unwrap_or(0);

    let summary = ResultsSummary {
        total_libraries: libraries.len(),
        total_findings: findings.len(),
        total_vulnerabilities,
        global_risk_score: global,
        risk_level: crate::risk::get_risk_level(global).as_str(),
    };

    Ok(Json(ResultsResponse {
        scan,
        libraries,
        findings,
        summary,
        diagnostics: compute_diagnostics(counts),
    }))
}

// ============================================
// Surface endpoint
// ============================================

#[derive(Debug, Serialize)]
pub struct SurfaceCategory {
    pub count: usize,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceCategories {
    pub forms: SurfaceCategory,
    pub inline_event_handlers: SurfaceCategory,
    pub iframes: SurfaceCategory,
    pub security_headers: SurfaceCategory,
    pub security_cookies: SurfaceCategory,
    pub other: SurfaceCategory,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceStats {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub moderate: usize,
    pub low: usize,
}

#[derive(Debug, Serialize)]
pub struct SurfaceResponse {
    pub scan: ScanRow,
    pub stats: SurfaceStats,
    pub categories: SurfaceCategories,
}

/// Bucket findings by type into the surface categories.
pub fn bucket_findings(findings: Vec<Finding>) -> SurfaceCategories {
    let mut forms = Vec::new();
    let mut handlers = Vec::new();
    let mut iframes = Vec::new();
    let mut headers = Vec::new();
    let mut cookies = Vec::new();
    let mut other = Vec::new();

    for finding in findings {
        match finding.finding_type {
            FindingType::FormSecurity => forms.push(finding),
            FindingType::InlineEventHandler => handlers.push(finding),
            FindingType::IframeSecurity => iframes.push(finding),
            FindingType::SecurityHeader => headers.push(finding),
            FindingType::SecurityCookie => cookies.push(finding),
            _ => other.push(finding),
        }
    }

    fn category(findings: Vec<Finding>) -> SurfaceCategory {
        SurfaceCategory {
            count: findings.len(),
            findings,
        }
    }

    SurfaceCategories {
        forms: category(forms),
        inline_event_handlers: category(handlers),
        iframes: category(iframes),
        security_headers: category(headers),
        security_cookies: category(cookies),
        other: category(other),
    }
}

pub async fn get_scan_surface(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SurfaceResponse>, ApiError> {
    let scan = load_scan(&state, id).await?;
    let findings = db::results::fetch_findings(&state.db, id)
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;

    let stats = SurfaceStats {
        total: findings.len(),
        critical: findings.iter().filter(|f| f.severity == Severity::Critical).count(),
        high: findings.iter().filter(|f| f.severity == Severity::High).count(),
        moderate: findings.iter().filter(|f| f.severity == Severity::Moderate).count(),
        low: findings.iter().filter(|f| f.severity == Severity::Low).count(),
    };

    Ok(Json(SurfaceResponse {
        scan,
        stats,
        categories: bucket_findings(findings),
    }))
}

/// Delete a scan: best-effort artifact purge first, then the cascading DB
/// delete. Orphan blobs are acceptable; a scan row pointing at purged blobs
/// is not.
pub async fn delete_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    // 404 before purging anything.
    load_scan(&state, id).await?;

    match state.artifacts.delete_prefix(&storage::scan_prefix(id)).await {
        Ok(removed) => tracing::info!("Purged {} artifact(s) for scan {}", removed, id),
        Err(e) => tracing::warn!("Artifact purge for scan {} failed: {}", id, e),
    }

    let deleted = db::scans::delete_scan(&state.db, id)
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;
    if !deleted {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Scan not found", "NOT_FOUND")),
        ));
    }

    Ok(StatusCode::NO_CONTENT)
}

// ============================================
// Last-good lookup
// ============================================

#[derive(Debug, Deserialize)]
pub struct LastGoodParams {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LastGoodResponse {
    pub scan: ScanRow,
    pub diagnostics: Diagnostics,
}

/// Latest completed scan for a URL whose results are not partial.
pub async fn get_last_good_scan(
    State(state): State<AppState>,
    Query(params): Query<LastGoodParams>,
) -> Result<Json<LastGoodResponse>, ApiError> {
    let url = params.url.filter(|u| !u.is_empty()).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "Missing required query parameter: url",
                "VALIDATION_ERROR",
            )),
        )
    })?;

    let candidates = db::scans::completed_scans_for_url(&state.db, &url, 10)
        .await
        .map_err(|e| ApiError::from(AppError::Database(e)))?;

    for scan in candidates {
        let counts = db::results::result_counts(&state.db, scan.id)
            .await
            .map_err(|e| ApiError::from(AppError::Database(e)))?;
        let diagnostics = compute_diagnostics(counts);
        if !diagnostics.partial_scan {
            return Ok(Json(LastGoodResponse { scan, diagnostics }));
        }
    }

    Err((
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "No non-partial completed scan for this URL",
            "NOT_FOUND",
        )),
    ))
}
