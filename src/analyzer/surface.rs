// HTML surface analysis: forms, inline event handlers, iframes, mixed
// content and subresource integrity, evaluated over the rendered top-level
// document.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::models::{Finding, FindingType, Severity};

static CSRF_INDICATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)csrf|xsrf|_token|authenticity_token").expect("valid regex"));

static INLINE_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bon\w+\s*=\s*"([^"]*)""#).expect("valid regex"));

static FORM_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("form").expect("valid selector"));
static PASSWORD_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"input[type="password"]"#).expect("valid selector"));
static IFRAME_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("iframe[src]").expect("valid selector"));
static SCRIPT_SRC_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script[src]").expect("valid selector"));
static LINK_HREF_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("link[href]").expect("valid selector"));
static IMG_SRC_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img[src]").expect("valid selector"));

/// Analyze the rendered HTML of the page. Pure: the only inputs are the
/// document text and the page URL.
pub fn analyze_html(html: &str, page_url: &Url) -> Vec<Finding> {
    let doc = Html::parse_document(html);
    let is_https = page_url.scheme() == "https";

    let mut findings = Vec::new();
    findings.extend(analyze_forms(&doc, is_https));
    findings.extend(analyze_inline_handlers(html));
    findings.extend(analyze_iframes(&doc, page_url));
    if is_https {
        findings.extend(analyze_mixed_content(&doc, page_url));
    }
    findings.extend(analyze_script_integrity(&doc, page_url));
    findings
}

fn analyze_forms(doc: &Html, is_https: bool) -> Vec<Finding> {
    let mut findings = Vec::new();

    let forms: Vec<_> = doc.select(&FORM_SEL).collect();
    if forms.is_empty() {
        return findings;
    }

    let get_forms = forms
        .iter()
        .filter(|f| {
            f.value()
                .attr("method")
                .map(|m| m.eq_ignore_ascii_case("get"))
                .unwrap_or(false)
        })
        .count();

    let has_password = forms
        .iter()
        .any(|f| f.select(&PASSWORD_SEL).next().is_some());

    let has_csrf_indicator = forms.iter().any(|f| CSRF_INDICATOR.is_match(&f.html()));

    if get_forms > 0 {
        findings.push(Finding {
            finding_type: FindingType::FormSecurity,
            title: "Forms using GET method detected".to_string(),
            description: format!(
                "{} form(s) submit via GET; submitted values leak into URLs, logs and referrers.",
                get_forms
            ),
            severity: Severity::Moderate,
            location: "page".to_string(),
            evidence: None,
        });
    }

    if has_password && !is_https {
        findings.push(Finding {
            finding_type: FindingType::FormSecurity,
            title: "Password field on a non-HTTPS page".to_string(),
            description: "Credentials entered on this page are transmitted in cleartext."
                .to_string(),
            severity: Severity::High,
            location: "page".to_string(),
            evidence: None,
        });
    }

    if !has_csrf_indicator {
        findings.push(Finding {
            finding_type: FindingType::FormSecurity,
            title: "Forms without CSRF protection tokens".to_string(),
            description: "No CSRF token indicator was found in any form on the page.".to_string(),
            severity: Severity::Moderate,
            location: "page".to_string(),
            evidence: None,
        });
    }

    findings
}

fn analyze_inline_handlers(html: &str) -> Vec<Finding> {
    let mut examples: Vec<String> = Vec::new();
    let mut total = 0usize;
    let mut dangerous = false;

    for cap in INLINE_HANDLER.captures_iter(html) {
        total += 1;
        let body = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        if body.contains("eval(") || body.contains("javascript:") {
            dangerous = true;
        }
        if examples.len() < 5 {
            let full = cap.get(0).map(|m| m.as_str()).unwrap_or("");
            examples.push(full.to_string());
        }
    }

    if total == 0 {
        return Vec::new();
    }

    vec![Finding {
        finding_type: FindingType::InlineEventHandler,
        title: "Inline event handlers detected".to_string(),
        description: format!(
            "{} inline event handler(s) found; inline handlers defeat CSP and widen the XSS surface.",
            total
        ),
        severity: if dangerous {
            Severity::High
        } else {
            Severity::Moderate
        },
        location: "page".to_string(),
        evidence: Some(examples.join("; ")),
    }]
}

fn analyze_iframes(doc: &Html, page_url: &Url) -> Vec<Finding> {
    let page_host = page_url.host_str().unwrap_or("");

    let mut third_party: Vec<String> = Vec::new();
    let mut insecure: Vec<String> = Vec::new();

    for iframe in doc.select(&IFRAME_SEL) {
        let Some(src) = iframe.value().attr("src") else {
            continue;
        };
        let Ok(resolved) = page_url.join(src) else {
            continue;
        };
        if resolved.scheme() == "http" {
            insecure.push(resolved.to_string());
        }
        if let Some(host) = resolved.host_str() {
            if !host.eq_ignore_ascii_case(page_host) {
                third_party.push(resolved.to_string());
            }
        }
    }

    let mut findings = Vec::new();

    if !third_party.is_empty() {
        findings.push(Finding {
            finding_type: FindingType::IframeSecurity,
            title: "Third-party iframes embedded".to_string(),
            description: format!("{} iframe(s) load content from other origins.", third_party.len()),
            severity: Severity::Moderate,
            location: "page".to_string(),
            evidence: Some(third_party.join("; ")),
        });
    }

    if !insecure.is_empty() {
        findings.push(Finding {
            finding_type: FindingType::IframeSecurity,
            title: "Iframe loaded over insecure HTTP".to_string(),
            description: format!("{} iframe(s) are embedded via plain http.", insecure.len()),
            severity: Severity::High,
            location: "page".to_string(),
            evidence: Some(insecure.join("; ")),
        });
    }

    findings
}

fn is_http_url(attr: &str) -> bool {
    attr.trim_start().to_ascii_lowercase().starts_with("http://")
}

fn analyze_mixed_content(doc: &Html, page_url: &Url) -> Vec<Finding> {
    let http_scripts = doc
        .select(&SCRIPT_SRC_SEL)
        .filter(|el| el.value().attr("src").map(is_http_url).unwrap_or(false))
        .count();
    let http_links = doc
        .select(&LINK_HREF_SEL)
        .filter(|el| el.value().attr("href").map(is_http_url).unwrap_or(false))
        .count();
    let http_images = doc
        .select(&IMG_SRC_SEL)
        .filter(|el| el.value().attr("src").map(is_http_url).unwrap_or(false))
        .count();
    let insecure_iframes = doc
        .select(&IFRAME_SEL)
        .filter(|el| {
            el.value()
                .attr("src")
                .and_then(|src| page_url.join(src).ok())
                .map(|u| u.scheme() == "http")
                .unwrap_or(false)
        })
        .count();

    let total = http_scripts + http_links + http_images + insecure_iframes;
    if total == 0 {
        return Vec::new();
    }

    // Active mixed content (scripts, frames) is executable; passive content
    // only degrades transport privacy.
    let severity = if http_scripts > 0 || insecure_iframes > 0 {
        Severity::High
    } else {
        Severity::Moderate
    };

    vec![Finding {
        finding_type: FindingType::SecurityHeader,
        title: "Mixed content detected on HTTPS page".to_string(),
        description: format!(
            "{} insecure resource(s): {} script(s), {} stylesheet link(s), {} image(s), {} iframe(s).",
            total, http_scripts, http_links, http_images, insecure_iframes
        ),
        severity,
        location: "page".to_string(),
        evidence: None,
    }]
}

fn analyze_script_integrity(doc: &Html, page_url: &Url) -> Vec<Finding> {
    let page_host = page_url.host_str().unwrap_or("");
    let mut findings = Vec::new();

    for script in doc.select(&SCRIPT_SRC_SEL) {
        let el = script.value();
        let Some(src) = el.attr("src") else { continue };
        let Ok(resolved) = page_url.join(src) else {
            continue;
        };
        if resolved.scheme() != "https" {
            continue;
        }
        let third_party = resolved
            .host_str()
            .map(|h| !h.eq_ignore_ascii_case(page_host))
            .unwrap_or(false);
        if third_party && el.attr("integrity").is_none() {
            findings.push(Finding {
                finding_type: FindingType::ScriptIntegrity,
                title: "External script without Subresource Integrity".to_string(),
                description:
                    "A third-party script is loaded without an integrity attribute; a compromised CDN can serve arbitrary code."
                        .to_string(),
                severity: Severity::Moderate,
                location: resolved.to_string(),
                evidence: None,
            });
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn titles(findings: &[Finding]) -> Vec<&str> {
        findings.iter().map(|f| f.title.as_str()).collect()
    }

    #[test]
    fn get_form_with_password_over_http() {
        let html = r#"<form method="GET"><input type="password" name="pw"></form>"#;
        let findings = analyze_html(html, &url("http://example.com/login"));
        let ts = titles(&findings);
        assert!(ts.contains(&"Forms using GET method detected"));
        assert!(ts.contains(&"Password field on a non-HTTPS page"));
        let pw = findings
            .iter()
            .find(|f| f.title == "Password field on a non-HTTPS page")
            .unwrap();
        assert_eq!(pw.severity, Severity::High);
        let get = findings
            .iter()
            .find(|f| f.title == "Forms using GET method detected")
            .unwrap();
        assert_eq!(get.severity, Severity::Moderate);
    }

    #[test]
    fn password_over_https_is_fine() {
        let html = r#"<form method="post"><input type="password"></form>"#;
        let findings = analyze_html(html, &url("https://example.com/login"));
        assert!(!titles(&findings).contains(&"Password field on a non-HTTPS page"));
    }

    #[test]
    fn csrf_token_suppresses_finding() {
        let with = r#"<form method="post"><input type="hidden" name="csrf_token" value="x"></form>"#;
        let without = r#"<form method="post"><input name="q"></form>"#;
        let f_with = analyze_html(with, &url("https://example.com/"));
        let f_without = analyze_html(without, &url("https://example.com/"));
        assert!(!titles(&f_with).contains(&"Forms without CSRF protection tokens"));
        assert!(titles(&f_without).contains(&"Forms without CSRF protection tokens"));
    }

    #[test]
    fn no_forms_no_form_findings() {
        let findings = analyze_html("<p>hello</p>", &url("https://example.com/"));
        assert!(!findings
            .iter()
            .any(|f| f.finding_type == FindingType::FormSecurity));
    }

    #[test]
    fn inline_handlers_collect_up_to_five_examples() {
        let html = r#"
            <a onclick="go(1)">1</a>
            <a onclick="go(2)">2</a>
            <a onclick="go(3)">3</a>
            <a onclick="go(4)">4</a>
            <a onclick="go(5)">5</a>
            <a onclick="go(6)">6</a>
        "#;
        let findings = analyze_inline_handlers(html);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.severity, Severity::Moderate);
        assert_eq!(f.evidence.as_ref().unwrap().matches("onclick").count(), 5);
    }

    #[test]
    fn eval_in_handler_escalates_severity() {
        let html = r#"<a onclick="eval(payload)">x</a>"#;
        let findings = analyze_inline_handlers(html);
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[test]
    fn third_party_and_insecure_iframes() {
        let html = r#"
            <iframe src="https://ads.example.net/frame"></iframe>
            <iframe src="http://widgets.example.org/w"></iframe>
        "#;
        let findings = analyze_html(html, &url("https://example.com/"));
        let ts = titles(&findings);
        assert!(ts.contains(&"Third-party iframes embedded"));
        assert!(ts.contains(&"Iframe loaded over insecure HTTP"));
        let insecure = findings
            .iter()
            .find(|f| f.title == "Iframe loaded over insecure HTTP")
            .unwrap();
        assert_eq!(insecure.severity, Severity::High);
    }

    #[test]
    fn same_origin_iframe_is_clean() {
        let html = r#"<iframe src="/embedded"></iframe>"#;
        let findings = analyze_html(html, &url("https://example.com/"));
        assert!(!findings
            .iter()
            .any(|f| f.finding_type == FindingType::IframeSecurity));
    }

    #[test]
    fn mixed_content_script_is_high() {
        let html = r#"<script src="http://cdn.example.net/foo.js"></script>"#;
        let findings = analyze_html(html, &url("https://example.com/"));
        let mixed = findings
            .iter()
            .find(|f| f.title == "Mixed content detected on HTTPS page")
            .expect("mixed content finding");
        assert_eq!(mixed.severity, Severity::High);
    }

    #[test]
    fn mixed_content_image_only_is_moderate() {
        let html = r#"<img src="http://img.example.net/a.png">"#;
        let findings = analyze_html(html, &url("https://example.com/"));
        let mixed = findings
            .iter()
            .find(|f| f.title == "Mixed content detected on HTTPS page")
            .unwrap();
        assert_eq!(mixed.severity, Severity::Moderate);
    }

    #[test]
    fn no_mixed_content_on_http_pages() {
        let html = r#"<script src="http://cdn.example.net/foo.js"></script>"#;
        let findings = analyze_html(html, &url("http://example.com/"));
        assert!(!findings
            .iter()
            .any(|f| f.title == "Mixed content detected on HTTPS page"));
    }

    #[test]
    fn sri_missing_on_third_party_script() {
        let html = r#"
            <script src="https://cdn.example.net/lib.js"></script>
            <script src="https://cdn.example.net/ok.js" integrity="sha384-abc"></script>
            <script src="/local.js"></script>
        "#;
        let findings = analyze_html(html, &url("https://example.com/"));
        let sri: Vec<_> = findings
            .iter()
            .filter(|f| f.finding_type == FindingType::ScriptIntegrity)
            .collect();
        assert_eq!(sri.len(), 1);
        assert_eq!(sri[0].location, "https://cdn.example.net/lib.js");
    }

    #[test]
    fn deterministic_multiset() {
        let html = r#"
            <form method="GET"><input type="password"></form>
            <iframe src="http://other.example.net/"></iframe>
            <a onclick="go()">x</a>
        "#;
        let a = analyze_html(html, &url("http://example.com/"));
        let b = analyze_html(html, &url("http://example.com/"));
        let mut ta: Vec<_> = a.iter().map(|f| (f.title.clone(), f.severity)).collect();
        let mut tb: Vec<_> = b.iter().map(|f| (f.title.clone(), f.severity)).collect();
        ta.sort();
        tb.sort();
        assert_eq!(ta, tb);
    }
}
