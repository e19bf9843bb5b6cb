// Scan row queries. Status transitions are compare-and-swap on the prior
// status so API reconciliation and worker writes can never clobber each
// other.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{ScanParameters, ScanStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRow {
    pub id: Uuid,
    pub url: String,
    pub parameters: ScanParameters,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_risk_score: Option<i32>,
    pub artifact_paths: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

const SCAN_COLUMNS: &str = "id, url, parameters, status, global_risk_score, artifact_paths, error, created_at, started_at, completed_at";

fn scan_from_row(row: &sqlx::postgres::PgRow) -> Result<ScanRow, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = ScanStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::Decode(
        format!("unknown scan status '{}'", status_raw).into(),
    ))?;
    let parameters: serde_json::Value = row.try_get("parameters")?;
    let parameters: ScanParameters = serde_json::from_value(parameters).unwrap_or_default();

    Ok(ScanRow {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        parameters,
        status,
        global_risk_score: row.try_get("global_risk_score")?,
        artifact_paths: row.try_get("artifact_paths")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub async fn create_scan(
    pool: &PgPool,
    id: Uuid,
    url: &str,
    parameters: &ScanParameters,
) -> Result<ScanRow, sqlx::Error> {
    let params_json = serde_json::to_value(parameters)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO scan (id, url, parameters, status)
        VALUES ($1, $2, $3, 'pending')
        RETURNING {SCAN_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(url)
    .bind(&params_json)
    .fetch_one(pool)
    .await?;

    scan_from_row(&row)
}

pub async fn get_scan(pool: &PgPool, id: Uuid) -> Result<Option<ScanRow>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {SCAN_COLUMNS} FROM scan WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(scan_from_row).transpose()
}

/// List scans ordered newest-first with `id` as the stable tiebreaker.
pub async fn list_scans(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<ScanRow>, i64), sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {SCAN_COLUMNS}
        FROM scan
        ORDER BY created_at DESC, id DESC
        LIMIT $1 OFFSET $2
        "#
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM scan")
        .fetch_one(pool)
        .await?
        .get("count");

    let scans = rows
        .iter()
        .map(scan_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((scans, total))
}

pub async fn delete_scan(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM scan WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Most recent scan for a URL, used by the per-URL cooldown check.
pub async fn most_recent_scan_for_url(
    pool: &PgPool,
    url: &str,
) -> Result<Option<ScanRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {SCAN_COLUMNS}
        FROM scan
        WHERE url = $1
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#
    ))
    .bind(url)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(scan_from_row).transpose()
}

/// Completed scans for a URL, newest first, used by the last-good lookup.
pub async fn completed_scans_for_url(
    pool: &PgPool,
    url: &str,
    limit: i64,
) -> Result<Vec<ScanRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {SCAN_COLUMNS}
        FROM scan
        WHERE url = $1 AND status = 'completed'
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#
    ))
    .bind(url)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(scan_from_row).collect()
}

/// Move a scan to `running`, setting `started_at` once. Idempotent: a
/// re-delivered job finds the row already running and the update still
/// matches.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scan
        SET status = 'running', started_at = COALESCE(started_at, NOW())
        WHERE id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Terminal failure write. Never overwrites an already-terminal scan.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scan
        SET status = 'failed', error = $2, completed_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Conditional status write used by API reconciliation: only applies when
/// the row still has the status the caller observed (CAS).
pub async fn reconcile_status(
    pool: &PgPool,
    id: Uuid,
    observed: ScanStatus,
    next: ScanStatus,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let set_completed = next.is_terminal();
    let result = sqlx::query(
        r#"
        UPDATE scan
        SET status = $3,
            error = COALESCE($4, error),
            completed_at = CASE WHEN $5 THEN COALESCE(completed_at, NOW()) ELSE completed_at END,
            started_at = CASE WHEN $3 <> 'pending' THEN COALESCE(started_at, NOW()) ELSE started_at END
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id)
    .bind(observed.as_str())
    .bind(next.as_str())
    .bind(error)
    .bind(set_completed)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_artifact_paths(
    pool: &PgPool,
    id: Uuid,
    artifact_paths: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scan SET artifact_paths = $2 WHERE id = $1")
        .bind(id)
        .bind(artifact_paths)
        .execute(pool)
        .await?;
    Ok(())
}
