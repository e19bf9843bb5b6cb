// Read-through advisory cache. Keyed by (package_name, version) with '' as
// the stored form of a version-less lookup; entries expire lazily via
// `last_updated + ttl_seconds`.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};

use crate::models::Vulnerability;

/// Expiry rule, factored out so the TTL arithmetic is testable without a
/// database: an entry is fresh while `now <= last_updated + ttl`.
pub fn is_fresh(last_updated: DateTime<Utc>, ttl_seconds: i64, now: DateTime<Utc>) -> bool {
    now <= last_updated + Duration::seconds(ttl_seconds)
}

fn stored_version(version: Option<&str>) -> &str {
    version.unwrap_or("")
}

/// Cached vulnerabilities for a package, or None on miss / expiry.
pub async fn get_fresh(
    pool: &PgPool,
    package_name: &str,
    version: Option<&str>,
) -> Result<Option<Vec<Vulnerability>>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT vulnerabilities, last_updated, ttl_seconds
        FROM vulnerability_cache
        WHERE package_name = $1 AND version = $2
        "#,
    )
    .bind(package_name)
    .bind(stored_version(version))
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;
    let ttl_seconds: i64 = row.try_get("ttl_seconds")?;
    if !is_fresh(last_updated, ttl_seconds, Utc::now()) {
        return Ok(None);
    }

    let raw: serde_json::Value = row.try_get("vulnerabilities")?;
    Ok(Some(serde_json::from_value(raw).unwrap_or_default()))
}

/// Last-writer-wins upsert of a feed result.
pub async fn upsert(
    pool: &PgPool,
    package_name: &str,
    version: Option<&str>,
    vulnerabilities: &[Vulnerability],
    ttl_seconds: i64,
) -> Result<(), sqlx::Error> {
    let json = serde_json::to_value(vulnerabilities)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO vulnerability_cache (package_name, version, vulnerabilities, last_updated, ttl_seconds)
        VALUES ($1, $2, $3, NOW(), $4)
        ON CONFLICT (package_name, version) DO UPDATE
        SET vulnerabilities = EXCLUDED.vulnerabilities,
            last_updated = NOW(),
            ttl_seconds = EXCLUDED.ttl_seconds
        "#,
    )
    .bind(package_name)
    .bind(stored_version(version))
    .bind(&json)
    .bind(ttl_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_fresh_within_ttl() {
        let updated = Utc::now();
        assert!(is_fresh(updated, 1, updated));
        assert!(is_fresh(
            updated,
            1,
            updated + Duration::milliseconds(900)
        ));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let updated = Utc::now();
        assert!(!is_fresh(updated, 1, updated + Duration::seconds(2)));
        assert!(!is_fresh(updated, 0, updated + Duration::seconds(1)));
    }

    #[test]
    fn version_none_maps_to_empty_string() {
        assert_eq!(stored_version(None), "");
        assert_eq!(stored_version(Some("1.2.3")), "1.2.3");
    }
}
