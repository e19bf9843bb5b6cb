// Vulnerability feed client: queries the OSV advisory API for npm packages
// and memoizes results in the `vulnerability_cache` table with a TTL.
//
// Feed failures are soft: the scan proceeds with an empty advisory list and
// a warning in the logs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::{Severity, Vulnerability};

/// TTL for cached empty results. Shorter than the hit TTL so a library that
/// gains its first advisory is picked up within the hour.
pub const NEGATIVE_CACHE_TTL_SECONDS: i64 = 3_600;

// ============================================
// OSV wire types
// ============================================

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    package: PackageRef<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PackageRef<'a> {
    name: &'a str,
    ecosystem: &'static str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    vulns: Vec<OsvVulnerability>,
}

#[derive(Debug, Deserialize)]
struct OsvVulnerability {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    severity: Vec<OsvSeverity>,
    #[serde(default)]
    references: Vec<OsvReference>,
    #[serde(default)]
    database_specific: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OsvSeverity {
    #[serde(rename = "type", default)]
    _kind: Option<String>,
    #[serde(default)]
    score: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsvReference {
    #[serde(default)]
    url: Option<String>,
}

impl OsvVulnerability {
    /// Numeric CVSS score when the record carries one. OSV publishes either
    /// a plain number or a CVSS vector string; only the numeric form is
    /// usable here.
    fn cvss_score(&self) -> Option<f64> {
        for sev in &self.severity {
            if let Some(score) = sev.score.as_deref() {
                if let Ok(n) = score.trim().parse::<f64>() {
                    return Some(n);
                }
            }
        }
        self.database_specific
            .as_ref()
            .and_then(|ds| ds.get("cvss_score"))
            .and_then(|v| v.as_f64())
    }

    fn derived_severity(&self) -> Severity {
        if let Some(score) = self.cvss_score() {
            return Severity::from_cvss(score);
        }
        // GitHub-sourced records label severity textually.
        self.database_specific
            .as_ref()
            .and_then(|ds| ds.get("severity"))
            .and_then(|v| v.as_str())
            .and_then(|s| Severity::parse(&s.to_ascii_lowercase()))
            .unwrap_or(Severity::Moderate)
    }

    fn into_vulnerability(self) -> Vulnerability {
        let severity = self.derived_severity();
        let cvss_score = self.cvss_score();
        let title = self
            .summary
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.clone());
        let description = self
            .details
            .clone()
            .or_else(|| self.summary.clone())
            .unwrap_or_default();
        Vulnerability {
            id: self.id,
            title,
            description,
            severity,
            cvss_score,
            references: self
                .references
                .into_iter()
                .filter_map(|r| r.url)
                .collect(),
        }
    }
}

// ============================================
// Feed client
// ============================================

pub struct OsvClient {
    http: reqwest::Client,
    base_url: String,
}

impl OsvClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AppError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Query advisories for one (package, version) pair. Errors propagate;
    /// the caller decides whether to soften them.
    pub async fn query(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Vec<Vulnerability>, AppError> {
        let url = format!("{}/v1/query", self.base_url.trim_end_matches('/'));
        let request = QueryRequest {
            package: PackageRef {
                name,
                ecosystem: "npm",
            },
            version,
        };

        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Internal(anyhow::anyhow!(
                "advisory API returned HTTP {}",
                response.status()
            )));
        }

        let body: QueryResponse = response.json().await?;
        Ok(body
            .vulns
            .into_iter()
            .map(OsvVulnerability::into_vulnerability)
            .collect())
    }
}

// ============================================
// Read-through cache service
// ============================================

pub struct VulnService {
    client: OsvClient,
    cache_ttl_seconds: i64,
}

impl VulnService {
    pub fn new(client: OsvClient, cache_ttl_seconds: i64) -> Self {
        Self {
            client,
            cache_ttl_seconds,
        }
    }

    /// Cache-first advisory lookup. Network or feed errors log a warning and
    /// return an empty list; an error never fails the scan and never writes
    /// to the cache.
    pub async fn get_vulnerabilities(
        &self,
        pool: &PgPool,
        name: &str,
        version: Option<&str>,
    ) -> Vec<Vulnerability> {
        match crate::db::vuln_cache::get_fresh(pool, name, version).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Vulnerability cache read failed for {}: {}", name, e);
            }
        }

        let vulns = match self.client.query(name, version).await {
            Ok(vulns) => vulns,
            Err(e) => {
                tracing::warn!(
                    "Advisory lookup failed for {}@{}: {}",
                    name,
                    version.unwrap_or("*"),
                    e
                );
                return Vec::new();
            }
        };

        // Empty results are cached too, on a shorter TTL, so advisory-free
        // libraries do not trigger a feed call on every scan.
        let ttl = if vulns.is_empty() {
            NEGATIVE_CACHE_TTL_SECONDS.min(self.cache_ttl_seconds)
        } else {
            self.cache_ttl_seconds
        };
        if let Err(e) = crate::db::vuln_cache::upsert(pool, name, version, &vulns, ttl).await {
            tracing::warn!("Vulnerability cache write failed for {}: {}", name, e);
        }

        vulns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> OsvClient {
        OsvClient::new(server.url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn maps_osv_records_to_vulnerabilities() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/query")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "package": {"name": "jquery", "ecosystem": "npm"},
                "version": "1.12.4"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "vulns": [
                        {
                            "id": "GHSA-gxr4-xjj5-5px2",
                            "summary": "XSS in jQuery",
                            "details": "Passing HTML from untrusted sources...",
                            "severity": [{"type": "CVSS_V3", "score": "9.8"}],
                            "references": [{"type": "WEB", "url": "https://example.com/advisory"}]
                        },
                        {
                            "id": "GHSA-no-score",
                            "database_specific": {"severity": "HIGH"}
                        }
                    ]
                }"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let vulns = client.query("jquery", Some("1.12.4")).await.unwrap();
        mock.assert_async().await;

        assert_eq!(vulns.len(), 2);
        let first = &vulns[0];
        assert_eq!(first.id, "GHSA-gxr4-xjj5-5px2");
        assert_eq!(first.title, "XSS in jQuery");
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(first.cvss_score, Some(9.8));
        assert_eq!(first.references, vec!["https://example.com/advisory"]);

        let second = &vulns[1];
        assert_eq!(second.title, "GHSA-no-score");
        assert_eq!(second.severity, Severity::High);
        assert_eq!(second.cvss_score, None);
    }

    #[tokio::test]
    async fn empty_feed_response_is_empty_list() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/query")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let client = client_for(&server);
        let vulns = client.query("left-pad", None).await.unwrap();
        assert!(vulns.is_empty());
    }

    #[tokio::test]
    async fn http_errors_propagate_from_client() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/query")
            .with_status(503)
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(client.query("jquery", None).await.is_err());
    }

    #[test]
    fn severity_derivation_prefers_numeric_score() {
        let vuln = OsvVulnerability {
            id: "X".into(),
            summary: None,
            details: None,
            severity: vec![OsvSeverity {
                _kind: None,
                score: Some("4.2".into()),
            }],
            references: vec![],
            database_specific: Some(serde_json::json!({"severity": "CRITICAL"})),
        };
        assert_eq!(vuln.derived_severity(), Severity::Moderate);
    }

    #[test]
    fn vector_strings_fall_back_to_textual_severity() {
        let vuln = OsvVulnerability {
            id: "X".into(),
            summary: None,
            details: None,
            severity: vec![OsvSeverity {
                _kind: Some("CVSS_V3".into()),
                score: Some("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H".into()),
            }],
            references: vec![],
            database_specific: Some(serde_json::json!({"severity": "MODERATE"})),
        };
        assert_eq!(vuln.cvss_score(), None);
        assert_eq!(vuln.derived_severity(), Severity::Moderate);
    }
}
