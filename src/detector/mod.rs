// Library detection: given a script's URL, body and (optionally) its source
// map, produce ranked `{name, version, confidence, method}` detections.
//
// Five independent methods run and their results are consolidated by library
// name: highest confidence wins, any non-empty version is preferred, method
// labels and evidence are merged.

pub mod signatures;
pub mod source_map;
pub mod url_patterns;

use std::collections::HashMap;

/// A single library detection before or after consolidation.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Canonical (lower-case) library name.
    pub name: String,
    pub version: Option<String>,
    /// 0-100.
    pub confidence: i32,
    /// Comma-joined method labels after consolidation.
    pub method: String,
    pub evidence: Vec<String>,
}

impl Detection {
    pub fn new(name: &str, version: Option<String>, confidence: i32, method: &str, evidence: String) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            version,
            confidence,
            method: method.to_string(),
            evidence: vec![evidence],
        }
    }
}

/// Run every detection method over one script and consolidate the results,
/// ordered by confidence descending. Each method degrades to zero detections
/// on malformed input; none of them can fail the scan.
pub fn detect_libraries(
    source_url: Option<&str>,
    content: &str,
    source_map: Option<&str>,
) -> Vec<Detection> {
    let mut raw: Vec<Detection> = Vec::new();

    if let Some(url) = source_url {
        raw.extend(url_patterns::detect_from_url(url));
    }
    raw.extend(signatures::detect_from_comments(content));
    if let Some(map) = source_map {
        raw.extend(source_map::detect_from_source_map(map));
    }
    raw.extend(signatures::detect_from_signatures(content));
    raw.extend(signatures::detect_from_version_strings(content));

    consolidate(raw)
}

/// Merge detections per library name: keep the best confidence, prefer any
/// version (highest-confidence versioned detection wins), concatenate method
/// labels, union evidence.
pub fn consolidate(detections: Vec<Detection>) -> Vec<Detection> {
    let mut by_name: HashMap<String, Detection> = HashMap::new();

    for det in detections {
        match by_name.get_mut(&det.name) {
            None => {
                by_name.insert(det.name.clone(), det);
            }
            Some(existing) => {
                // Version preference: any version beats none; between two
                // versions the higher-confidence detection decides.
                match (&existing.version, &det.version) {
                    (None, Some(_)) => existing.version = det.version.clone(),
                    (Some(_), Some(_)) if det.confidence > existing.confidence => {
                        existing.version = det.version.clone();
                    }
                    _ => {}
                }
                existing.confidence = existing.confidence.max(det.confidence);
                for label in det.method.split(',') {
                    if !existing.method.split(',').any(|m| m == label) {
                        existing.method.push(',');
                        existing.method.push_str(label);
                    }
                }
                for ev in det.evidence {
                    if !existing.evidence.contains(&ev) {
                        existing.evidence.push(ev);
                    }
                }
            }
        }
    }

    let mut out: Vec<Detection> = by_name.into_values().collect();
    out.sort_by(|a, b| b.confidence.cmp(&a.confidence).then(a.name.cmp(&b.name)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_jquery_from_cdn_url() {
        let dets = detect_libraries(
            Some("https://cdnjs.cloudflare.com/ajax/libs/jquery/1.12.4/jquery.min.js"),
            "",
            None,
        );
        let jq = dets.iter().find(|d| d.name == "jquery").expect("jquery");
        assert_eq!(jq.version.as_deref(), Some("1.12.4"));
        assert!(jq.confidence >= 80);
    }

    #[test]
    fn consolidation_prefers_version_and_max_confidence() {
        let merged = consolidate(vec![
            Detection::new("react", None, 65, "signature", "React.createElement".into()),
            Detection::new("react", Some("17.0.2".into()), 80, "url-pattern", "cdn url".into()),
        ]);
        assert_eq!(merged.len(), 1);
        let r = &merged[0];
        assert_eq!(r.version.as_deref(), Some("17.0.2"));
        assert_eq!(r.confidence, 80);
        assert!(r.method.contains("signature") && r.method.contains("url-pattern"));
        assert_eq!(r.evidence.len(), 2);
    }

    #[test]
    fn consolidation_keeps_higher_confidence_version() {
        let merged = consolidate(vec![
            Detection::new("vue", Some("2.6.0".into()), 60, "comment", "banner".into()),
            Detection::new("vue", Some("2.6.14".into()), 95, "version-string", "Vue.version".into()),
        ]);
        assert_eq!(merged[0].version.as_deref(), Some("2.6.14"));
    }

    #[test]
    fn results_are_ordered_by_confidence() {
        let content = r#"
            /*! lodash v4.17.21 */
            React.createElement('div');
            jQuery.fn.jquery = "3.6.0";
        "#;
        let dets = detect_libraries(None, content, None);
        assert!(dets.len() >= 2);
        for pair in dets.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn combined_url_and_signature_merge() {
        let dets = detect_libraries(
            Some("https://example.com/assets/react-17.0.2.min.js"),
            "React.createElement('div', null);",
            None,
        );
        let react: Vec<_> = dets.iter().filter(|d| d.name == "react").collect();
        assert_eq!(react.len(), 1);
        assert_eq!(react[0].version.as_deref(), Some("17.0.2"));
    }

    #[test]
    fn garbage_inputs_produce_no_detections() {
        let dets = detect_libraries(Some("not a url at all"), "binary\u{0}garbage", Some("{not json"));
        assert!(dets.is_empty());
    }
}
