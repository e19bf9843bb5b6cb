use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================
// Scan lifecycle
// ============================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScanStatus::Pending),
            "running" => Some(ScanStatus::Running),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are immutable: no worker or reconciliation write may
    /// move a scan out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

/// Caller-supplied scan parameters, persisted verbatim on the scan row and
/// forwarded to the render worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanParameters {
    pub render_java_script: bool,
    /// Page-load timeout in seconds.
    pub timeout: u64,
    /// Crawl depth; 0 renders the target page only.
    pub depth: u32,
    pub user_agent: Option<String>,
    pub headers: std::collections::HashMap<String, String>,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            render_java_script: false,
            timeout: 30,
            depth: 0,
            user_agent: None,
            headers: std::collections::HashMap::new(),
        }
    }
}

// ============================================
// Severity & risk levels
// ============================================

/// Variant order is the severity order; `PartialOrd` is used when picking
/// the dominant severity of a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "moderate" | "medium" => Some(Severity::Moderate),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// CVSS-to-severity mapping: >= 9 critical, >= 7 high, >= 4 moderate,
    /// else low.
    pub fn from_cvss(score: f64) -> Self {
        if score >= 9.0 {
            Severity::Critical
        } else if score >= 7.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Moderate
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

// ============================================
// Findings
// ============================================

/// Closed set of finding kinds. The analyzer matches exhaustively on this
/// enum so every kind always has a title/severity mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingType {
    EvalUsage,
    HardcodedToken,
    DynamicImport,
    Webassembly,
    DomXssSink,
    FormSecurity,
    InlineEventHandler,
    IframeSecurity,
    SecurityHeader,
    SecurityCookie,
    ScriptIntegrity,
    Info,
    Error,
    Cve,
    RemoteCode,
}

impl FindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingType::EvalUsage => "EVAL_USAGE",
            FindingType::HardcodedToken => "HARDCODED_TOKEN",
            FindingType::DynamicImport => "DYNAMIC_IMPORT",
            FindingType::Webassembly => "WEBASSEMBLY",
            FindingType::DomXssSink => "DOM_XSS_SINK",
            FindingType::FormSecurity => "FORM_SECURITY",
            FindingType::InlineEventHandler => "INLINE_EVENT_HANDLER",
            FindingType::IframeSecurity => "IFRAME_SECURITY",
            FindingType::SecurityHeader => "SECURITY_HEADER",
            FindingType::SecurityCookie => "SECURITY_COOKIE",
            FindingType::ScriptIntegrity => "SCRIPT_INTEGRITY",
            FindingType::Info => "INFO",
            FindingType::Error => "ERROR",
            FindingType::Cve => "CVE",
            FindingType::RemoteCode => "REMOTE_CODE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EVAL_USAGE" => Some(FindingType::EvalUsage),
            "HARDCODED_TOKEN" => Some(FindingType::HardcodedToken),
            "DYNAMIC_IMPORT" => Some(FindingType::DynamicImport),
            "WEBASSEMBLY" => Some(FindingType::Webassembly),
            "DOM_XSS_SINK" => Some(FindingType::DomXssSink),
            "FORM_SECURITY" => Some(FindingType::FormSecurity),
            "INLINE_EVENT_HANDLER" => Some(FindingType::InlineEventHandler),
            "IFRAME_SECURITY" => Some(FindingType::IframeSecurity),
            "SECURITY_HEADER" => Some(FindingType::SecurityHeader),
            "SECURITY_COOKIE" => Some(FindingType::SecurityCookie),
            "SCRIPT_INTEGRITY" => Some(FindingType::ScriptIntegrity),
            "INFO" => Some(FindingType::Info),
            "ERROR" => Some(FindingType::Error),
            "CVE" => Some(FindingType::Cve),
            "REMOTE_CODE" => Some(FindingType::RemoteCode),
            _ => None,
        }
    }
}

/// A discrete security observation attached to a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub finding_type: FindingType,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    /// Where the finding was observed: a script URL, "inline-script-3",
    /// a header name, or the page itself.
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

// ============================================
// Vulnerabilities (embedded in libraries)
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    #[serde(default)]
    pub references: Vec<String>,
}

// ============================================
// Scripts & libraries
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: Uuid,
    pub scan_id: Uuid,
    /// Absent for inline scripts.
    pub source_url: Option<String>,
    pub is_inline: bool,
    pub artifact_path: String,
    /// SHA-256 of the script body, hex-encoded.
    pub fingerprint: String,
    pub detected_patterns: Vec<String>,
    pub estimated_version: Option<String>,
    /// 0-100.
    pub confidence: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub name: String,
    pub detected_version: Option<String>,
    pub related_scripts: Vec<Uuid>,
    pub vulnerabilities: Vec<Vulnerability>,
    /// 0-100.
    pub risk_score: i32,
    /// 0-100.
    pub confidence: i32,
    /// Comma-joined detection method labels, e.g. "url-pattern,signature".
    pub detection_method: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_follows_variant_order() {
        assert!(Severity::Low < Severity::Moderate);
        assert!(Severity::Moderate < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_from_cvss_boundaries() {
        assert_eq!(Severity::from_cvss(9.0), Severity::Critical);
        assert_eq!(Severity::from_cvss(8.9), Severity::High);
        assert_eq!(Severity::from_cvss(7.0), Severity::High);
        assert_eq!(Severity::from_cvss(4.0), Severity::Moderate);
        assert_eq!(Severity::from_cvss(3.9), Severity::Low);
    }

    #[test]
    fn finding_type_round_trips_through_str() {
        let all = [
            FindingType::EvalUsage,
            FindingType::HardcodedToken,
            FindingType::DynamicImport,
            FindingType::Webassembly,
            FindingType::DomXssSink,
            FindingType::FormSecurity,
            FindingType::InlineEventHandler,
            FindingType::IframeSecurity,
            FindingType::SecurityHeader,
            FindingType::SecurityCookie,
            FindingType::ScriptIntegrity,
            FindingType::Info,
            FindingType::Error,
            FindingType::Cve,
            FindingType::RemoteCode,
        ];
        for ft in all {
            assert_eq!(FindingType::parse(ft.as_str()), Some(ft));
        }
    }

    #[test]
    fn scan_status_terminality() {
        assert!(!ScanStatus::Pending.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
    }
}
