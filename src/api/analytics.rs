use std::time::Duration;

use axum::{extract::State, Json};

use super::AppState;
use crate::db;
use crate::error::{ApiError, AppError};

/// Summary responses are cached briefly and deduplicated so a dashboard
/// refresh storm costs one aggregation query.
const SUMMARY_CACHE_TTL: Duration = Duration::from_secs(10);

/// Dashboard metrics over the whole scan corpus.
pub async fn get_summary(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.clone();
    let value = state
        .response_cache
        .get_or_compute("analytics:summary", SUMMARY_CACHE_TTL, || async move {
            let summary = db::analytics::summary(&db)
                .await
                .map_err(AppError::Database)?;
            serde_json::to_value(&summary).map_err(AppError::Serialization)
        })
        .await
        .map_err(ApiError::from)?;

    Ok(Json(value))
}
