// Source-map detection: parse the map's `sources` array and look for
// node_modules paths, which name the bundled packages directly.
//
// Source maps come from the scanned site and are untrusted: input size is
// bounded before parsing and any malformed JSON degrades to zero detections.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::Detection;

const METHOD: &str = "source-map";
const CONFIDENCE: i32 = 85;

/// Maps larger than this are not parsed at all.
const MAX_SOURCE_MAP_BYTES: usize = 10 * 1024 * 1024;

/// node_modules/<name>/... or node_modules/@scope/name/...
/// pnpm-style paths embed the version: node_modules/<name>@<version>/...
static NODE_MODULES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"node_modules/(@[A-Za-z0-9._-]+/[A-Za-z0-9._-]+|[A-Za-z0-9._-]+)(?:@([0-9]+\.[0-9]+(?:\.[0-9]+)?[A-Za-z0-9.-]*))?/")
        .expect("valid regex")
});

#[derive(Deserialize)]
struct SourceMap {
    #[serde(default)]
    sources: Vec<String>,
}

pub fn detect_from_source_map(map_json: &str) -> Vec<Detection> {
    if map_json.len() > MAX_SOURCE_MAP_BYTES {
        tracing::warn!(
            "Source map exceeds {} bytes, skipping detection",
            MAX_SOURCE_MAP_BYTES
        );
        return Vec::new();
    }

    let map: SourceMap = match serde_json::from_str(map_json) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };

    let mut out: Vec<Detection> = Vec::new();

    for source in &map.sources {
        let Some(cap) = NODE_MODULES.captures(source) else {
            continue;
        };
        let name = cap[1].to_string();
        let version = cap.get(2).map(|m| m.as_str().to_string());
        // One detection per package; keep the first versioned sighting.
        if let Some(existing) = out.iter_mut().find(|d| d.name == name.to_ascii_lowercase()) {
            if existing.version.is_none() && version.is_some() {
                existing.version = version;
            }
            continue;
        }
        out.push(Detection::new(
            &name,
            version,
            CONFIDENCE,
            METHOD,
            source.clone(),
        ));
    }

    out
}
