// Pattern & surface analyzer: pure, deterministic functions over HTML
// bodies, script contents and response headers. Same input always produces
// the same multiset of findings.

pub mod headers;
pub mod patterns;
pub mod surface;

use std::collections::HashMap;

use url::Url;

use crate::models::Finding;

/// Run the full page-level analysis: HTML surface checks plus response
/// header checks. Script-content checks live in `patterns` and run per
/// script.
pub fn analyze_page(
    html: &str,
    page_url: &Url,
    response_headers: &HashMap<String, String>,
) -> Vec<Finding> {
    let mut findings = surface::analyze_html(html, page_url);
    findings.extend(headers::analyze_headers(
        response_headers,
        page_url.scheme() == "https",
    ));
    findings
}

/// Lower-case every header name so lookups are case-insensitive. Repeated
/// headers (Set-Cookie) are newline-joined.
pub fn normalize_headers<'a, I>(raw: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in raw {
        let key = name.to_ascii_lowercase();
        match map.get_mut(&key) {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => {
                map.insert(key, value.to_string());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_headers_lowercases_and_joins() {
        let headers = normalize_headers([
            ("Content-Type", "text/html"),
            ("Set-Cookie", "a=1"),
            ("Set-Cookie", "b=2; Secure"),
        ]);
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert_eq!(headers.get("set-cookie").unwrap(), "a=1\nb=2; Secure");
    }

    #[test]
    fn analyze_page_combines_surface_and_header_findings() {
        let url = Url::parse("https://example.com/").unwrap();
        let headers = normalize_headers([("content-type", "text/html")]);
        let html = r#"<html><body><form method="GET"><input name="q"></form></body></html>"#;
        let findings = analyze_page(html, &url, &headers);

        // At minimum: GET form + missing CSP + missing HSTS.
        assert!(findings.iter().any(|f| f.title.contains("GET method")));
        assert!(findings
            .iter()
            .any(|f| f.title.contains("Content-Security-Policy")));
        assert!(findings
            .iter()
            .any(|f| f.title.contains("Strict-Transport-Security")));
    }
}
