// Analysis result persistence. Everything the analyze worker produces for a
// scan commits in one transaction together with the scan's terminal status,
// so readers never observe a half-written result set.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{Finding, FindingType, Library, Script, Severity, Vulnerability};

/// Row counts used by the idempotency short-circuit and the results
/// diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultCounts {
    pub scripts: i64,
    pub libraries: i64,
    pub findings: i64,
}

pub async fn result_counts(pool: &PgPool, scan_id: Uuid) -> Result<ResultCounts, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM script  WHERE scan_id = $1) AS scripts,
            (SELECT COUNT(*) FROM library WHERE scan_id = $1) AS libraries,
            (SELECT COUNT(*) FROM finding WHERE scan_id = $1) AS findings
        "#,
    )
    .bind(scan_id)
    .fetch_one(pool)
    .await?;

    Ok(ResultCounts {
        scripts: row.get("scripts"),
        libraries: row.get("libraries"),
        findings: row.get("findings"),
    })
}

/// Atomically persist the analysis output and complete the scan: insert all
/// scripts, libraries and findings, set `global_risk_score`, flip the scan
/// to `completed`. Rolls back as a unit on any failure.
pub async fn commit_analysis(
    pool: &PgPool,
    scan_id: Uuid,
    scripts: &[Script],
    libraries: &[Library],
    findings: &[Finding],
    global_risk_score: i32,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for script in scripts {
        sqlx::query(
            r#"
            INSERT INTO script (id, scan_id, source_url, is_inline, artifact_path,
                                fingerprint, detected_patterns, estimated_version, confidence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(script.id)
        .bind(script.scan_id)
        .bind(&script.source_url)
        .bind(script.is_inline)
        .bind(&script.artifact_path)
        .bind(&script.fingerprint)
        .bind(&script.detected_patterns)
        .bind(&script.estimated_version)
        .bind(script.confidence)
        .execute(&mut *tx)
        .await?;
    }

    for library in libraries {
        let vulns_json = serde_json::to_value(&library.vulnerabilities)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            r#"
            INSERT INTO library (id, scan_id, name, detected_version, related_scripts,
                                 vulnerabilities, risk_score, confidence, detection_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (scan_id, name) DO UPDATE
            SET detected_version = EXCLUDED.detected_version,
                related_scripts = EXCLUDED.related_scripts,
                vulnerabilities = EXCLUDED.vulnerabilities,
                risk_score = EXCLUDED.risk_score,
                confidence = EXCLUDED.confidence,
                detection_method = EXCLUDED.detection_method
            "#,
        )
        .bind(library.id)
        .bind(library.scan_id)
        .bind(&library.name)
        .bind(&library.detected_version)
        .bind(&library.related_scripts)
        .bind(&vulns_json)
        .bind(library.risk_score)
        .bind(library.confidence)
        .bind(&library.detection_method)
        .execute(&mut *tx)
        .await?;
    }

    for finding in findings {
        sqlx::query(
            r#"
            INSERT INTO finding (id, scan_id, finding_type, title, description,
                                 severity, location, evidence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scan_id)
        .bind(finding.finding_type.as_str())
        .bind(&finding.title)
        .bind(&finding.description)
        .bind(finding.severity.as_str())
        .bind(&finding.location)
        .bind(&finding.evidence)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE scan
        SET global_risk_score = $2, status = 'completed', completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(scan_id)
    .bind(global_risk_score)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub async fn fetch_libraries(pool: &PgPool, scan_id: Uuid) -> Result<Vec<Library>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, scan_id, name, detected_version, related_scripts,
               vulnerabilities, risk_score, confidence, detection_method
        FROM library
        WHERE scan_id = $1
        ORDER BY risk_score DESC, name
        "#,
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let vulns_json: serde_json::Value = row.try_get("vulnerabilities")?;
            let vulnerabilities: Vec<Vulnerability> =
                serde_json::from_value(vulns_json).unwrap_or_default();
            Ok(Library {
                id: row.try_get("id")?,
                scan_id: row.try_get("scan_id")?,
                name: row.try_get("name")?,
                detected_version: row.try_get("detected_version")?,
                related_scripts: row.try_get("related_scripts")?,
                vulnerabilities,
                risk_score: row.try_get("risk_score")?,
                confidence: row.try_get("confidence")?,
                detection_method: row.try_get("detection_method")?,
            })
        })
        .collect()
}

pub async fn fetch_findings(pool: &PgPool, scan_id: Uuid) -> Result<Vec<Finding>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT finding_type, title, description, severity, location, evidence
        FROM finding
        WHERE scan_id = $1
        ORDER BY
            CASE severity
                WHEN 'critical' THEN 1
                WHEN 'high' THEN 2
                WHEN 'moderate' THEN 3
                ELSE 4
            END,
            title
        "#,
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let type_raw: String = row.try_get("finding_type")?;
            let severity_raw: String = row.try_get("severity")?;
            Ok(Finding {
                finding_type: FindingType::parse(&type_raw).unwrap_or(FindingType::Info),
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                severity: Severity::parse(&severity_raw).unwrap_or(Severity::Low),
                location: row.try_get("location")?,
                evidence: row.try_get("evidence")?,
            })
        })
        .collect()
}

pub async fn fetch_scripts(pool: &PgPool, scan_id: Uuid) -> Result<Vec<Script>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, scan_id, source_url, is_inline, artifact_path, fingerprint,
               detected_patterns, estimated_version, confidence
        FROM script
        WHERE scan_id = $1
        ORDER BY is_inline, source_url
        "#,
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(Script {
                id: row.try_get("id")?,
                scan_id: row.try_get("scan_id")?,
                source_url: row.try_get("source_url")?,
                is_inline: row.try_get("is_inline")?,
                artifact_path: row.try_get("artifact_path")?,
                fingerprint: row.try_get("fingerprint")?,
                detected_patterns: row.try_get("detected_patterns")?,
                estimated_version: row.try_get("estimated_version")?,
                confidence: row.try_get("confidence")?,
            })
        })
        .collect()
}
