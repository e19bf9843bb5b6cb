// Content-based detection: banner comments, well-known API signatures and
// explicit version-string disclosures.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Detection;

/// Only the head of a file is scanned for banner comments.
const COMMENT_SCAN_LINES: usize = 50;

// ============================================
// Comment / banner scan
// ============================================

/// Bannered release header, e.g. `/*! jQuery v3.6.0 | (c) ... */`
static BANNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([A-Za-z][A-Za-z0-9._-]{1,40}?)(?:\.js)?\s+v(?:ersion:?\s*)?([0-9]+\.[0-9]+\.[0-9]+)")
        .expect("valid regex")
});

/// `@version 1.2.3` annotation; the library name must come from elsewhere,
/// so this is only used when the same comment block names the library.
static AT_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@version\s+v?([0-9]+\.[0-9]+\.[0-9]+)").expect("valid regex"));

/// A comment line that is just a library name, e.g. ` * Lodash <https://…>`.
static BARE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?://|/?\*+!?)\s*([A-Za-z][A-Za-z0-9._-]{2,40})\s*(?:<|$)")
        .expect("valid regex")
});

fn is_comment_line(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("//") || t.starts_with("/*") || t.starts_with('*') || t.starts_with("*/")
}

pub fn detect_from_comments(content: &str) -> Vec<Detection> {
    let mut out = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines().take(COMMENT_SCAN_LINES) {
        if !is_comment_line(line) {
            continue;
        }

        if let Some(cap) = BANNER.captures(line) {
            let name = cap[1].to_string();
            // Skip generic words that show up in license banners.
            let lowered = name.to_ascii_lowercase();
            if !matches!(
                lowered.as_str(),
                "copyright" | "license" | "version" | "released" | "build" | "under"
            ) {
                out.push(Detection::new(
                    &name,
                    Some(cap[2].to_string()),
                    70,
                    "comment",
                    line.trim().to_string(),
                ));
                continue;
            }
        }

        // Remember a bare library name line (e.g. ` * Lodash <https://...>`)
        // so a later @version annotation can be attributed to it.
        if pending_name.is_none() {
            if let Some(cap) = BARE_NAME.captures(line) {
                pending_name = Some(cap[1].to_string());
            }
        }

        if let Some(cap) = AT_VERSION.captures(line) {
            if let Some(name) = pending_name.take() {
                out.push(Detection::new(
                    &name,
                    Some(cap[1].to_string()),
                    60,
                    "comment",
                    line.trim().to_string(),
                ));
            }
        }
    }

    out
}

// ============================================
// API signature scan
// ============================================

struct Signature {
    name: &'static str,
    regex: Lazy<Regex>,
}

static SIGNATURES: [Signature; 9] = [
    Signature {
        name: "react",
        regex: Lazy::new(|| {
            Regex::new(r"React\.createElement|__REACT_DEVTOOLS_GLOBAL_HOOK__").expect("valid regex")
        }),
    },
    Signature {
        name: "jquery",
        regex: Lazy::new(|| {
            Regex::new(r"jQuery\.fn\.jquery|\$\.fn\.jquery|jQuery\.extend").expect("valid regex")
        }),
    },
    Signature {
        name: "vue",
        regex: Lazy::new(|| {
            Regex::new(r"Vue\.component|__VUE_DEVTOOLS_GLOBAL_HOOK__").expect("valid regex")
        }),
    },
    Signature {
        name: "angular",
        regex: Lazy::new(|| Regex::new(r"angular\.module\s*\(").expect("valid regex")),
    },
    Signature {
        name: "lodash",
        regex: Lazy::new(|| Regex::new(r"lodash_placeholder|_\.VERSION").expect("valid regex")),
    },
    Signature {
        name: "moment",
        regex: Lazy::new(|| Regex::new(r"moment\.isMoment|moment\.fn\.").expect("valid regex")),
    },
    Signature {
        name: "axios",
        regex: Lazy::new(|| Regex::new(r"axios\.interceptors").expect("valid regex")),
    },
    Signature {
        name: "d3",
        regex: Lazy::new(|| Regex::new(r"d3\.select\s*\(").expect("valid regex")),
    },
    Signature {
        name: "backbone",
        regex: Lazy::new(|| Regex::new(r"Backbone\.Model").expect("valid regex")),
    },
];

/// Match known API shapes (call expressions and member accesses) against the
/// script body.
pub fn detect_from_signatures(content: &str) -> Vec<Detection> {
    let mut out = Vec::new();
    for sig in &SIGNATURES {
        if let Some(m) = sig.regex.find(content) {
            out.push(Detection::new(
                sig.name,
                None,
                65,
                "signature",
                m.as_str().to_string(),
            ));
        }
    }
    out
}

// ============================================
// Version-string disclosures
// ============================================

/// `<Global>.version = "x.y.z"` style disclosures.
static VERSION_ASSIGN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_$][A-Za-z0-9_$]*)\.version\s*[:=]\s*['"]([0-9]+\.[0-9]+\.[0-9]+)['"]"#)
        .expect("valid regex")
});

/// jQuery publishes its version on the prototype instead.
static JQUERY_FN_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"fn\.jquery\s*[:=]\s*['"]([0-9]+\.[0-9]+(?:\.[0-9]+)?)['"]"#).expect("valid regex")
});

/// Lodash uses an upper-case VERSION constant.
static LODASH_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"_\.VERSION\s*=\s*['"]([0-9]+\.[0-9]+\.[0-9]+)['"]"#).expect("valid regex")
});

fn global_to_library(global: &str) -> Option<&'static str> {
    match global {
        "React" | "react" => Some("react"),
        "ReactDOM" => Some("react-dom"),
        "Vue" | "vue" => Some("vue"),
        "jQuery" => Some("jquery"),
        "angular" => Some("angular"),
        "moment" => Some("moment"),
        "axios" => Some("axios"),
        "d3" => Some("d3"),
        "Backbone" => Some("backbone"),
        "Ember" => Some("ember"),
        _ => None,
    }
}

pub fn detect_from_version_strings(content: &str) -> Vec<Detection> {
    let mut out = Vec::new();

    for cap in VERSION_ASSIGN.captures_iter(content) {
        if let Some(lib) = global_to_library(&cap[1]) {
            out.push(Detection::new(
                lib,
                Some(cap[2].to_string()),
                95,
                "version-string",
                cap[0].to_string(),
            ));
        }
    }

    if let Some(cap) = JQUERY_FN_VERSION.captures(content) {
        out.push(Detection::new(
            "jquery",
            Some(cap[1].to_string()),
            95,
            "version-string",
            cap[0].to_string(),
        ));
    }

    if let Some(cap) = LODASH_VERSION.captures(content) {
        out.push(Detection::new(
            "lodash",
            Some(cap[1].to_string()),
            95,
            "version-string",
            cap[0].to_string(),
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_comment_detection() {
        let src = "/*! jQuery v3.6.0 | (c) OpenJS Foundation */\nwindow.x = 1;";
        let dets = detect_from_comments(src);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].name, "jquery");
        assert_eq!(dets[0].version.as_deref(), Some("3.6.0"));
    }

    #[test]
    fn at_version_attributed_to_named_block() {
        let src = "/**\n * Lodash <https://lodash.com/>\n * @version 4.17.21\n */";
        let dets = detect_from_comments(src);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].name, "lodash");
        assert_eq!(dets[0].version.as_deref(), Some("4.17.21"));
    }

    #[test]
    fn comments_past_line_fifty_are_ignored() {
        let mut src = String::new();
        for _ in 0..60 {
            src.push_str("var a = 1;\n");
        }
        src.push_str("/*! jQuery v3.6.0 */\n");
        assert!(detect_from_comments(&src).is_empty());
    }

    #[test]
    fn signature_scan_finds_frameworks() {
        let src = r#"
            var el = React.createElement('div');
            angular.module('app', []);
            d3.select("body");
        "#;
        let dets = detect_from_signatures(src);
        let names: Vec<_> = dets.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"react"));
        assert!(names.contains(&"angular"));
        assert!(names.contains(&"d3"));
        assert!(dets.iter().all(|d| d.confidence == 65));
    }

    #[test]
    fn version_string_disclosures() {
        let src = r#"
            React.version = "17.0.2";
            jQuery.fn.jquery = "1.12.4";
            _.VERSION = '4.17.21';
        "#;
        let dets = detect_from_version_strings(src);
        let find = |n: &str| dets.iter().find(|d| d.name == n).unwrap();
        assert_eq!(find("react").version.as_deref(), Some("17.0.2"));
        assert_eq!(find("jquery").version.as_deref(), Some("1.12.4"));
        assert_eq!(find("lodash").version.as_deref(), Some("4.17.21"));
        assert!(dets.iter().all(|d| d.confidence == 95));
    }

    #[test]
    fn unknown_globals_are_not_reported() {
        let src = r#"MyInternalThing.version = "1.0.0";"#;
        assert!(detect_from_version_strings(src).is_empty());
    }
}
