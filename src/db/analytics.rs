// Dashboard aggregation queries for the analytics summary endpoint.

use serde::Serialize;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskDistribution {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopVulnerability {
    pub name: String,
    pub severity: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    #[serde(rename = "totalScans")]
    pub total_scans: i64,
    #[serde(rename = "activeThreats")]
    pub active_threats: i64,
    #[serde(rename = "totalVulnerabilities")]
    pub total_vulnerabilities: i64,
    #[serde(rename = "averageRiskScore")]
    pub average_risk_score: f64,
    #[serde(rename = "averageScanDurationSeconds")]
    pub average_scan_duration_seconds: f64,
    #[serde(rename = "riskDistribution")]
    pub risk_distribution: RiskDistribution,
    #[serde(rename = "vulnerabilityTrends")]
    pub vulnerability_trends: Vec<TrendPoint>,
    #[serde(rename = "recentScans")]
    pub recent_scans: Vec<TrendPoint>,
    pub libraries_analyzed: i64,
    pub top_vulnerabilities: Vec<TopVulnerability>,
}

pub async fn summary(pool: &PgPool) -> Result<AnalyticsSummary, sqlx::Error> {
    // Headline counters. Averages only consider completed scans; the
    // duration additionally requires both timestamps.
    let totals = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM scan) AS total_scans,
            (SELECT COUNT(*) FROM finding WHERE severity = 'critical') AS active_threats,
            (SELECT COALESCE(SUM(jsonb_array_length(vulnerabilities)), 0) FROM library) AS total_vulnerabilities,
            (SELECT COALESCE(AVG(global_risk_score), 0)::float8
             FROM scan WHERE status = 'completed' AND global_risk_score IS NOT NULL) AS average_risk_score,
            (SELECT COALESCE(AVG(EXTRACT(EPOCH FROM (completed_at - started_at))), 0)::float8
             FROM scan
             WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL)
                AS average_scan_duration,
            (SELECT COUNT(*) FROM library) AS libraries_analyzed
        "#,
    )
    .fetch_one(pool)
    .await?;

    let distribution = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE global_risk_score >= 80) AS critical,
            COUNT(*) FILTER (WHERE global_risk_score >= 60 AND global_risk_score < 80) AS high,
            COUNT(*) FILTER (WHERE global_risk_score >= 30 AND global_risk_score < 60) AS medium,
            COUNT(*) FILTER (WHERE global_risk_score < 30) AS low
        FROM scan
        WHERE status = 'completed' AND global_risk_score IS NOT NULL
        "#,
    )
    .fetch_one(pool)
    .await?;

    let vulnerability_trends = sqlx::query(
        r#"
        SELECT TO_CHAR(date_trunc('day', s.created_at), 'YYYY-MM-DD') AS date,
               COALESCE(SUM(jsonb_array_length(l.vulnerabilities)), 0) AS count
        FROM scan s
        JOIN library l ON l.scan_id = s.id
        WHERE s.created_at >= NOW() - INTERVAL '30 days'
        GROUP BY 1
        ORDER BY 1
        "#,
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| TrendPoint {
        date: row.get("date"),
        count: row.get("count"),
    })
    .collect();

    let recent_scans = sqlx::query(
        r#"
        SELECT TO_CHAR(date_trunc('day', created_at), 'YYYY-MM-DD') AS date,
               COUNT(*) AS count
        FROM scan
        WHERE created_at >= NOW() - INTERVAL '7 days'
        GROUP BY 1
        ORDER BY 1
        "#,
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| TrendPoint {
        date: row.get("date"),
        count: row.get("count"),
    })
    .collect();

    let top_vulnerabilities = sqlx::query(
        r#"
        SELECT v->>'title' AS name,
               v->>'severity' AS severity,
               COUNT(*) AS count
        FROM library, jsonb_array_elements(vulnerabilities) AS v
        GROUP BY 1, 2
        ORDER BY count DESC, name
        LIMIT 5
        "#,
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| TopVulnerability {
        name: row.get::<Option<String>, _>("name").unwrap_or_default(),
        severity: row
            .get::<Option<String>, _>("severity")
            .unwrap_or_else(|| "low".to_string()),
        count: row.get("count"),
    })
    .collect();

    Ok(AnalyticsSummary {
        total_scans: totals.get("total_scans"),
        active_threats: totals.get("active_threats"),
        total_vulnerabilities: totals.get("total_vulnerabilities"),
        average_risk_score: totals.get("average_risk_score"),
        average_scan_duration_seconds: totals.get("average_scan_duration"),
        risk_distribution: RiskDistribution {
            critical: distribution.get("critical"),
            high: distribution.get("high"),
            medium: distribution.get("medium"),
            low: distribution.get("low"),
        },
        vulnerability_trends,
        recent_scans,
        libraries_analyzed: totals.get("libraries_analyzed"),
        top_vulnerabilities,
    })
}
