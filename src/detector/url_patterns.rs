// URL-shape detection: CDN and npm-style path layouts that encode a library
// name and, usually, a version.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Detection;

const METHOD: &str = "url-pattern";

/// cdnjs layout: /ajax/libs/<name>/<version>/<file>
static CDNJS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/ajax/libs/([A-Za-z0-9._-]+)/([0-9]+\.[0-9]+(?:\.[0-9]+)?[A-Za-z0-9.-]*)/")
        .expect("valid regex")
});

/// jsDelivr / unpkg npm layout: /npm/<name>@<version>/ (scoped names included)
static NPM_AT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(?:npm/|unpkg\.com/)?(@[A-Za-z0-9._-]+/[A-Za-z0-9._-]+|[A-Za-z0-9._-]+)@([0-9]+\.[0-9]+(?:\.[0-9]+)?[A-Za-z0-9.-]*)(?:/|$)")
        .expect("valid regex")
});

/// Versioned filename: <name>-<version>.js / <name>.<version>.min.js
static VERSIONED_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z][A-Za-z0-9._-]*?)[-.]([0-9]+\.[0-9]+\.[0-9]+)(?:[-.][A-Za-z0-9.]+)?\.js(?:\?|#|$)")
        .expect("valid regex")
});

/// Bare filenames of well-known libraries, version unknown.
static KNOWN_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"/(jquery|react|react-dom|vue|angular|lodash|moment|bootstrap|axios|d3|backbone|ember)(?:\.min|\.slim|\.bundle)*\.js(?:\?|#|$)",
    )
    .expect("valid regex")
});

pub fn detect_from_url(url: &str) -> Vec<Detection> {
    let mut out = Vec::new();

    if let Some(cap) = CDNJS.captures(url) {
        out.push(Detection::new(
            &cap[1],
            Some(cap[2].to_string()),
            80,
            METHOD,
            url.to_string(),
        ));
        return out;
    }

    if let Some(cap) = NPM_AT.captures(url) {
        // Scoped packages keep the scope in the name.
        let name = cap[1].trim_start_matches('/');
        out.push(Detection::new(
            name,
            Some(cap[2].to_string()),
            80,
            METHOD,
            url.to_string(),
        ));
        return out;
    }

    if let Some(cap) = VERSIONED_FILE.captures(url) {
        out.push(Detection::new(
            &cap[1],
            Some(cap[2].to_string()),
            80,
            METHOD,
            url.to_string(),
        ));
        return out;
    }

    if let Some(cap) = KNOWN_FILE.captures(url) {
        out.push(Detection::new(&cap[1], None, 40, METHOD, url.to_string()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdnjs_path() {
        let dets =
            detect_from_url("https://cdnjs.cloudflare.com/ajax/libs/lodash.js/4.17.21/lodash.min.js");
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].name, "lodash.js");
        assert_eq!(dets[0].version.as_deref(), Some("4.17.21"));
        assert_eq!(dets[0].confidence, 80);
    }

    #[test]
    fn jsdelivr_npm_path() {
        let dets = detect_from_url("https://cdn.jsdelivr.net/npm/vue@2.6.14/dist/vue.js");
        assert_eq!(dets[0].name, "vue");
        assert_eq!(dets[0].version.as_deref(), Some("2.6.14"));
    }

    #[test]
    fn scoped_npm_package() {
        let dets = detect_from_url("https://cdn.jsdelivr.net/npm/@angular/core@12.0.0/bundles/core.js");
        assert_eq!(dets[0].name, "@angular/core");
        assert_eq!(dets[0].version.as_deref(), Some("12.0.0"));
    }

    #[test]
    fn versioned_filename() {
        let dets = detect_from_url("https://example.com/js/jquery-1.12.4.min.js");
        assert_eq!(dets[0].name, "jquery");
        assert_eq!(dets[0].version.as_deref(), Some("1.12.4"));
    }

    #[test]
    fn bare_known_filename_lower_confidence() {
        let dets = detect_from_url("https://example.com/static/react.min.js");
        assert_eq!(dets[0].name, "react");
        assert_eq!(dets[0].version, None);
        assert_eq!(dets[0].confidence, 40);
    }

    #[test]
    fn unknown_urls_yield_nothing() {
        assert!(detect_from_url("https://example.com/app/main.js").is_empty());
        assert!(detect_from_url("garbage").is_empty());
    }
}
