// Response-header analysis: security headers, CORS configuration and
// Set-Cookie flags. Operates on a lower-cased header map (see
// `analyzer::normalize_headers`).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Finding, FindingType, Severity};

static WEAK_REFERRER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)unsafe-url|no-referrer-when-downgrade").expect("valid regex"));

static SENSITIVE_COOKIE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)session|auth|token|jwt").expect("valid regex"));

fn header_finding(title: &str, description: &str, severity: Severity, location: &str) -> Finding {
    Finding {
        finding_type: FindingType::SecurityHeader,
        title: title.to_string(),
        description: description.to_string(),
        severity,
        location: location.to_string(),
        evidence: None,
    }
}

/// Analyze the page's response headers. `is_https` switches on the checks
/// that only make sense for secure origins (HSTS, the cross-origin
/// isolation trio).
pub fn analyze_headers(headers: &HashMap<String, String>, is_https: bool) -> Vec<Finding> {
    let mut findings = Vec::new();

    let get = |name: &str| headers.get(name).map(|v| v.as_str());

    // Content-Security-Policy
    match get("content-security-policy") {
        None => findings.push(header_finding(
            "Content-Security-Policy header missing",
            "Without a CSP the browser has no restriction on script sources.",
            Severity::Moderate,
            "content-security-policy",
        )),
        Some(csp) if csp.contains("unsafe-inline") || csp.contains("unsafe-eval") => {
            findings.push(header_finding(
                "Content-Security-Policy allows unsafe directives",
                "The policy permits unsafe-inline or unsafe-eval, negating most XSS protection.",
                Severity::High,
                "content-security-policy",
            ));
        }
        Some(_) => {}
    }

    // Strict-Transport-Security (required on HTTPS)
    if is_https && get("strict-transport-security").is_none() {
        findings.push(header_finding(
            "Strict-Transport-Security header missing",
            "Browsers will still attempt plain-HTTP connections to this host.",
            Severity::High,
            "strict-transport-security",
        ));
    }

    // X-Frame-Options
    match get("x-frame-options") {
        None => findings.push(header_finding(
            "X-Frame-Options header missing",
            "The page may be framed by any site (clickjacking).",
            Severity::Moderate,
            "x-frame-options",
        )),
        Some(v) => {
            let upper = v.trim().to_ascii_uppercase();
            if upper != "DENY" && upper != "SAMEORIGIN" {
                findings.push(header_finding(
                    "Weak X-Frame-Options value",
                    "Values other than DENY or SAMEORIGIN offer no reliable framing protection.",
                    Severity::Moderate,
                    "x-frame-options",
                ));
            }
        }
    }

    // X-Content-Type-Options
    let nosniff = get("x-content-type-options")
        .map(|v| v.trim().eq_ignore_ascii_case("nosniff"))
        .unwrap_or(false);
    if !nosniff {
        findings.push(header_finding(
            "X-Content-Type-Options not set to nosniff",
            "MIME sniffing can promote plain text uploads into executable content.",
            Severity::Moderate,
            "x-content-type-options",
        ));
    }

    // Referrer-Policy
    match get("referrer-policy") {
        None => findings.push(header_finding(
            "Referrer-Policy header missing",
            "Full URLs may leak to third parties via the Referer header.",
            Severity::Moderate,
            "referrer-policy",
        )),
        Some(v) if WEAK_REFERRER.is_match(v) => findings.push(header_finding(
            "Weak Referrer-Policy value",
            "unsafe-url and no-referrer-when-downgrade leak full URLs cross-origin.",
            Severity::Moderate,
            "referrer-policy",
        )),
        Some(_) => {}
    }

    // Permissions-Policy
    if get("permissions-policy").is_none() {
        findings.push(header_finding(
            "Permissions-Policy header missing",
            "Powerful browser features (camera, geolocation, …) are not restricted.",
            Severity::Low,
            "permissions-policy",
        ));
    }

    // Cross-origin isolation headers only apply on HTTPS.
    if is_https {
        let coop_ok = get("cross-origin-opener-policy")
            .map(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("same-origin")
                    || v.eq_ignore_ascii_case("same-origin-allow-popups")
            })
            .unwrap_or(false);
        if !coop_ok {
            findings.push(header_finding(
                "Cross-Origin-Opener-Policy missing or weak",
                "Without COOP the window can be retained by cross-origin openers.",
                Severity::Low,
                "cross-origin-opener-policy",
            ));
        }
        if get("cross-origin-embedder-policy").is_none() {
            findings.push(header_finding(
                "Cross-Origin-Embedder-Policy header missing",
                "COEP is required for cross-origin isolation.",
                Severity::Low,
                "cross-origin-embedder-policy",
            ));
        }
        if get("cross-origin-resource-policy").is_none() {
            findings.push(header_finding(
                "Cross-Origin-Resource-Policy header missing",
                "Responses may be embeddable by any origin.",
                Severity::Low,
                "cross-origin-resource-policy",
            ));
        }
    }

    // CORS
    let allow_origin = get("access-control-allow-origin").map(str::trim);
    let allow_credentials = get("access-control-allow-credentials")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if allow_origin == Some("*") {
        if allow_credentials {
            findings.push(header_finding(
                "Insecure CORS configuration: wildcard origin with credentials",
                "Any site can issue credentialed requests and read the responses.",
                Severity::High,
                "access-control-allow-origin",
            ));
        } else {
            findings.push(header_finding(
                "CORS wildcard origin",
                "Any origin may read responses from this endpoint.",
                Severity::Moderate,
                "access-control-allow-origin",
            ));
        }
    }

    findings.extend(analyze_cookies(get("set-cookie")));

    findings
}

/// Cookie flag checks over the (possibly newline-joined) Set-Cookie header.
/// At most one sensitive-cookie finding and one generic-cookie finding are
/// emitted; the scan stops once both exist.
fn analyze_cookies(set_cookie: Option<&str>) -> Vec<Finding> {
    let Some(raw) = set_cookie else {
        return Vec::new();
    };

    let mut sensitive_emitted = false;
    let mut generic_emitted = false;
    let mut findings = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let name = line.split('=').next().unwrap_or("").trim();
        let lower = line.to_ascii_lowercase();
        let secure = lower.contains("secure");
        let http_only = lower.contains("httponly");
        let same_site = lower.contains("samesite");

        if secure && http_only && same_site {
            continue;
        }

        let mut missing = Vec::new();
        if !secure {
            missing.push("Secure");
        }
        if !http_only {
            missing.push("HttpOnly");
        }
        if !same_site {
            missing.push("SameSite");
        }

        let is_sensitive = SENSITIVE_COOKIE.is_match(name);

        if is_sensitive && !sensitive_emitted {
            sensitive_emitted = true;
            findings.push(Finding {
                finding_type: FindingType::SecurityCookie,
                title: "Sensitive cookie set without security flags".to_string(),
                description: format!(
                    "Cookie '{}' looks session-related but is missing: {}.",
                    name,
                    missing.join(", ")
                ),
                severity: Severity::High,
                location: "set-cookie".to_string(),
                evidence: Some(name.to_string()),
            });
        } else if !is_sensitive && !generic_emitted {
            generic_emitted = true;
            findings.push(Finding {
                finding_type: FindingType::SecurityCookie,
                title: "Cookie set without security flags".to_string(),
                description: format!("Cookie '{}' is missing: {}.", name, missing.join(", ")),
                severity: Severity::Moderate,
                location: "set-cookie".to_string(),
                evidence: Some(name.to_string()),
            });
        }

        if sensitive_emitted && generic_emitted {
            break;
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::normalize_headers;

    fn titles(findings: &[Finding]) -> Vec<&str> {
        findings.iter().map(|f| f.title.as_str()).collect()
    }

    #[test]
    fn missing_everything_on_https() {
        let headers = HashMap::new();
        let findings = analyze_headers(&headers, true);
        let ts = titles(&findings);
        assert!(ts.contains(&"Content-Security-Policy header missing"));
        assert!(ts.contains(&"Strict-Transport-Security header missing"));
        assert!(ts.contains(&"X-Frame-Options header missing"));
        assert!(ts.contains(&"X-Content-Type-Options not set to nosniff"));
        assert!(ts.contains(&"Referrer-Policy header missing"));
        assert!(ts.contains(&"Permissions-Policy header missing"));
        assert!(ts.contains(&"Cross-Origin-Opener-Policy missing or weak"));
        assert!(ts.contains(&"Cross-Origin-Embedder-Policy header missing"));
        assert!(ts.contains(&"Cross-Origin-Resource-Policy header missing"));
    }

    #[test]
    fn hsts_not_required_on_http() {
        let findings = analyze_headers(&HashMap::new(), false);
        assert!(!titles(&findings).contains(&"Strict-Transport-Security header missing"));
        assert!(!titles(&findings).contains(&"Cross-Origin-Embedder-Policy header missing"));
    }

    #[test]
    fn unsafe_csp_directives_flagged_high() {
        let headers = normalize_headers([(
            "Content-Security-Policy",
            "default-src 'self'; script-src 'unsafe-inline'",
        )]);
        let findings = analyze_headers(&headers, false);
        let csp = findings
            .iter()
            .find(|f| f.title == "Content-Security-Policy allows unsafe directives")
            .unwrap();
        assert_eq!(csp.severity, Severity::High);
    }

    #[test]
    fn strict_csp_is_clean() {
        let headers = normalize_headers([("content-security-policy", "default-src 'self'")]);
        let findings = analyze_headers(&headers, false);
        assert!(!findings
            .iter()
            .any(|f| f.location == "content-security-policy"));
    }

    #[test]
    fn weak_x_frame_options() {
        let headers = normalize_headers([("x-frame-options", "ALLOW-FROM https://x.example")]);
        let findings = analyze_headers(&headers, false);
        assert!(titles(&findings).contains(&"Weak X-Frame-Options value"));

        let headers = normalize_headers([("x-frame-options", "sameorigin")]);
        let findings = analyze_headers(&headers, false);
        assert!(!titles(&findings).contains(&"Weak X-Frame-Options value"));
    }

    #[test]
    fn weak_referrer_policy() {
        let headers = normalize_headers([("referrer-policy", "no-referrer-when-downgrade")]);
        let findings = analyze_headers(&headers, false);
        assert!(titles(&findings).contains(&"Weak Referrer-Policy value"));
    }

    #[test]
    fn cors_wildcard_with_credentials_is_high() {
        let headers = normalize_headers([
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Credentials", "true"),
        ]);
        let findings = analyze_headers(&headers, false);
        let cors = findings
            .iter()
            .find(|f| f.title == "Insecure CORS configuration: wildcard origin with credentials")
            .expect("cors finding");
        assert_eq!(cors.severity, Severity::High);
    }

    #[test]
    fn cors_wildcard_alone_is_moderate() {
        let headers = normalize_headers([("access-control-allow-origin", "*")]);
        let findings = analyze_headers(&headers, false);
        let cors = findings
            .iter()
            .find(|f| f.title == "CORS wildcard origin")
            .unwrap();
        assert_eq!(cors.severity, Severity::Moderate);
    }

    #[test]
    fn sensitive_cookie_missing_flags() {
        let headers = normalize_headers([("set-cookie", "session_id=abc; Path=/")]);
        let findings = analyze_headers(&headers, true);
        let cookie = findings
            .iter()
            .find(|f| f.title == "Sensitive cookie set without security flags")
            .unwrap();
        assert_eq!(cookie.severity, Severity::High);
        assert_eq!(cookie.evidence.as_deref(), Some("session_id"));
    }

    #[test]
    fn at_most_one_finding_per_cookie_class() {
        let headers = normalize_headers([
            ("Set-Cookie", "session=1"),
            ("Set-Cookie", "auth_token=2"),
            ("Set-Cookie", "theme=dark"),
            ("Set-Cookie", "lang=en"),
        ]);
        let findings = analyze_headers(&headers, true);
        let cookie_findings: Vec<_> = findings
            .iter()
            .filter(|f| f.finding_type == FindingType::SecurityCookie)
            .collect();
        assert_eq!(cookie_findings.len(), 2);
    }

    #[test]
    fn fully_flagged_cookie_is_clean() {
        let headers = normalize_headers([(
            "set-cookie",
            "session=abc; Secure; HttpOnly; SameSite=Strict",
        )]);
        let findings = analyze_headers(&headers, true);
        assert!(!findings
            .iter()
            .any(|f| f.finding_type == FindingType::SecurityCookie));
    }
}
