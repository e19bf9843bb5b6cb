// Wire formats for queue payloads: the scan task consumed by the render
// worker, the analysis task it publishes, and the result both report back.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ScanParameters;
use crate::renderer::RenderOutcome;

/// Payload of a `scan-queue` job; jobId == scanId.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTask {
    pub scan_id: Uuid,
    pub url: String,
    #[serde(default)]
    pub parameters: ScanParameters,
}

/// One stored external-script artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptArtifact {
    pub url: String,
    pub key: String,
    /// True when the body could not be fetched and an empty blob was stored.
    #[serde(default)]
    pub fetch_failed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRefs {
    pub dom_snapshot: String,
    pub scripts: Vec<ScriptArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_trace: Option<String>,
}

/// Payload of an `analysis-queue` job; jobId == scanId.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    pub scan_id: Uuid,
    pub artifacts: ArtifactRefs,
    pub dom_analysis: RenderOutcome,
    #[serde(default)]
    pub fetch_errors: Vec<String>,
}

/// Worker-reported completion payload stored on the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub scan_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactRefs>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_task_round_trips_with_camel_case_keys() {
        let task = ScanTask {
            scan_id: Uuid::new_v4(),
            url: "https://example.com".into(),
            parameters: ScanParameters::default(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("scanId").is_some());
        assert!(json["parameters"].get("renderJavaScript").is_some());
        let back: ScanTask = serde_json::from_value(json).unwrap();
        assert_eq!(back.scan_id, task.scan_id);
    }

    #[test]
    fn analysis_task_tolerates_missing_optional_fields() {
        let scan_id = Uuid::new_v4();
        let json = serde_json::json!({
            "scanId": scan_id,
            "artifacts": {
                "domSnapshot": format!("scans/{}/dom-snapshot.html", scan_id),
                "scripts": []
            },
            "domAnalysis": {
                "pageUrl": "https://example.com",
                "finalUrl": "https://example.com/",
                "status": 200,
                "headers": {},
                "inlineScripts": [],
                "externalScripts": [],
                "sourceMaps": {},
                "resources": [],
                "pagesCrawled": 1
            }
        });
        let task: AnalysisTask = serde_json::from_value(json).unwrap();
        assert_eq!(task.scan_id, scan_id);
        assert!(task.fetch_errors.is_empty());
    }
}
