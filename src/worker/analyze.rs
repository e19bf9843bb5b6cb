// Analyze worker: turns stored render artifacts into scripts, libraries,
// findings and risk scores, committed in a single DB transaction.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::analyzer;
use crate::db;
use crate::detector::{self, Detection};
use crate::error::AppError;
use crate::models::{Finding, FindingType, Library, ScanStatus, Script, Severity};
use crate::queue::JobQueue;
use crate::risk;
use crate::storage::ArtifactStore;
use crate::vuln::VulnService;

use super::tasks::{AnalysisTask, TaskResult};

/// In-process guard against double dispatch of the same scan. The queue
/// lease already guarantees cross-process exclusivity; this covers a
/// re-delivered job racing its predecessor inside one process.
#[derive(Default)]
pub struct ProcessingSlots {
    busy: Mutex<HashSet<Uuid>>,
}

impl ProcessingSlots {
    pub fn try_acquire(&self, scan_id: Uuid) -> bool {
        self.busy.lock().expect("slots mutex").insert(scan_id)
    }

    pub fn release(&self, scan_id: Uuid) {
        self.busy.lock().expect("slots mutex").remove(&scan_id);
    }
}

pub struct AnalyzeWorker {
    pub db: PgPool,
    pub analysis_queue: Arc<JobQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub vuln: Arc<VulnService>,
    slots: ProcessingSlots,
}

impl AnalyzeWorker {
    pub fn new(
        db: PgPool,
        analysis_queue: Arc<JobQueue>,
        artifacts: Arc<dyn ArtifactStore>,
        vuln: Arc<VulnService>,
    ) -> Self {
        Self {
            db,
            analysis_queue,
            artifacts,
            vuln,
            slots: ProcessingSlots::default(),
        }
    }

    pub async fn process(&self, payload: serde_json::Value) -> Result<TaskResult, AppError> {
        let task: AnalysisTask = serde_json::from_value(payload)?;
        let scan_id = task.scan_id;

        if !self.slots.try_acquire(scan_id) {
            return Err(AppError::Analysis(format!(
                "scan {} already has a live processing slot",
                scan_id
            )));
        }
        let result = self.process_inner(&task).await;
        self.slots.release(scan_id);

        if let Err(e) = &result {
            db::scans::mark_failed(&self.db, scan_id, &e.to_string())
                .await
                .ok();
        }
        result
    }

    async fn process_inner(&self, task: &AnalysisTask) -> Result<TaskResult, AppError> {
        let scan_id = task.scan_id;

        // Idempotency: a re-delivered job for an already-committed scan
        // returns the existing results untouched.
        if let Some(scan) = db::scans::get_scan(&self.db, scan_id).await? {
            if scan.status == ScanStatus::Completed {
                let counts = db::results::result_counts(&self.db, scan_id).await?;
                if counts.libraries > 0 || counts.findings > 0 || counts.scripts > 0 {
                    tracing::info!("Scan {} already analyzed, short-circuiting", scan_id);
                    return Ok(TaskResult {
                        scan_id,
                        success: true,
                        artifacts: Some(task.artifacts.clone()),
                    });
                }
            }
        } else {
            return Err(AppError::NotFound(format!("scan {}", scan_id)));
        }

        db::scans::mark_running(&self.db, scan_id).await?;
        self.analysis_queue.heartbeat(&scan_id.to_string(), Some(10)).await.ok();

        let dom = &task.dom_analysis;
        let page_url = url::Url::parse(&dom.final_url)
            .map_err(|_| AppError::Analysis(format!("invalid final URL: {}", dom.final_url)))?;

        let mut findings: Vec<Finding> = Vec::new();
        let mut scripts: Vec<Script> = Vec::new();
        // Script id -> detections, used for consolidation afterwards.
        let mut detections_by_script: Vec<(Uuid, Vec<Detection>)> = Vec::new();
        // Script id -> risky pattern kinds, feeding the co-location penalty.
        let mut patterns_by_script: HashMap<Uuid, Vec<FindingType>> = HashMap::new();

        // Inline scripts travel inside the analysis payload.
        for (i, inline) in dom.inline_scripts.iter().enumerate() {
            let location = format!("inline-script-{}", i + 1);
            let script_findings = analyzer::patterns::detect_risky_patterns(&inline.content, &location);
            let labels = analyzer::patterns::pattern_labels(&script_findings);
            let detections = detector::detect_libraries(None, &inline.content, None);

            let script_id = Uuid::new_v4();
            patterns_by_script.insert(
                script_id,
                script_findings.iter().map(|f| f.finding_type).collect(),
            );
            findings.extend(script_findings);
            scripts.push(Script {
                id: script_id,
                scan_id,
                source_url: None,
                is_inline: true,
                artifact_path: task.artifacts.dom_snapshot.clone(),
                fingerprint: fingerprint(inline.content.as_bytes()),
                detected_patterns: labels,
                estimated_version: detections.first().and_then(|d| d.version.clone()),
                confidence: detections.first().map(|d| d.confidence).unwrap_or(0),
            });
            detections_by_script.push((script_id, detections));
        }

        self.analysis_queue.heartbeat(&scan_id.to_string(), Some(30)).await.ok();

        // External scripts come back from the artifact store.
        for artifact in &task.artifacts.scripts {
            let body = match self.artifacts.get(&artifact.key).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::warn!("Artifact {} unavailable: {}", artifact.key, e);
                    String::new()
                }
            };

            let location = artifact.url.clone();
            let script_findings = analyzer::patterns::detect_risky_patterns(&body, &location);
            let labels = analyzer::patterns::pattern_labels(&script_findings);

            let source_map = crate::renderer::source_map_url(&body, &artifact.url)
                .and_then(|map_url| dom.source_maps.get(map_url.as_str()).cloned());

            let detections =
                detector::detect_libraries(Some(&artifact.url), &body, source_map.as_deref());

            let script_id = Uuid::new_v4();
            patterns_by_script.insert(
                script_id,
                script_findings.iter().map(|f| f.finding_type).collect(),
            );
            findings.extend(script_findings);
            scripts.push(Script {
                id: script_id,
                scan_id,
                source_url: Some(artifact.url.clone()),
                is_inline: false,
                artifact_path: artifact.key.clone(),
                fingerprint: fingerprint(body.as_bytes()),
                detected_patterns: labels,
                estimated_version: detections.first().and_then(|d| d.version.clone()),
                confidence: detections.first().map(|d| d.confidence).unwrap_or(0),
            });
            detections_by_script.push((script_id, detections));
        }

        // Page-level surface and header findings from the DOM snapshot.
        let snapshot = self
            .artifacts
            .get(&task.artifacts.dom_snapshot)
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        findings.extend(analyzer::analyze_page(&snapshot, &page_url, &dom.headers));

        // Failed script fetches are surfaced as findings rather than lost.
        for error in &task.fetch_errors {
            findings.push(Finding {
                finding_type: FindingType::Error,
                title: "External script could not be fetched".to_string(),
                description: error.clone(),
                severity: Severity::Low,
                location: "render".to_string(),
                evidence: None,
            });
        }

        self.analysis_queue.heartbeat(&scan_id.to_string(), Some(55)).await.ok();

        // Consolidate per-script detections into libraries.
        let libraries = self
            .build_libraries(scan_id, &detections_by_script, &patterns_by_script)
            .await;

        self.analysis_queue.heartbeat(&scan_id.to_string(), Some(80)).await.ok();

        let library_risks: Vec<i32> = libraries.iter().map(|l| l.risk_score).collect();
        let critical_findings = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        let global_risk = risk::calculate_global_risk(&library_risks, critical_findings);

        db::results::commit_analysis(
            &self.db,
            scan_id,
            &scripts,
            &libraries,
            &findings,
            global_risk,
        )
        .await?;

        self.analysis_queue.heartbeat(&scan_id.to_string(), Some(100)).await.ok();
        tracing::info!(
            "Scan {} analyzed: {} scripts, {} libraries, {} findings, risk {}",
            scan_id,
            scripts.len(),
            libraries.len(),
            findings.len(),
            global_risk
        );

        Ok(TaskResult {
            scan_id,
            success: true,
            artifacts: Some(task.artifacts.clone()),
        })
    }

    /// Merge detections across scripts by library name, enrich each library
    /// with advisories and score it.
    async fn build_libraries(
        &self,
        scan_id: Uuid,
        detections_by_script: &[(Uuid, Vec<Detection>)],
        patterns_by_script: &HashMap<Uuid, Vec<FindingType>>,
    ) -> Vec<Library> {
        struct Candidate {
            detection: Detection,
            related_scripts: Vec<Uuid>,
        }

        let mut by_name: HashMap<String, Candidate> = HashMap::new();
        for (script_id, detections) in detections_by_script {
            for det in detections {
                match by_name.get_mut(&det.name) {
                    None => {
                        by_name.insert(
                            det.name.clone(),
                            Candidate {
                                detection: det.clone(),
                                related_scripts: vec![*script_id],
                            },
                        );
                    }
                    Some(candidate) => {
                        let merged = detector::consolidate(vec![
                            candidate.detection.clone(),
                            det.clone(),
                        ]);
                        if let Some(best) = merged.into_iter().next() {
                            candidate.detection = best;
                        }
                        if !candidate.related_scripts.contains(script_id) {
                            candidate.related_scripts.push(*script_id);
                        }
                    }
                }
            }
        }

        let candidates: Vec<Candidate> = by_name.into_values().collect();

        // Advisory lookups for distinct libraries proceed in parallel; the
        // cache layer is last-writer-wins on identical keys.
        let vuln_lists = futures::future::join_all(candidates.iter().map(|candidate| {
            self.vuln.get_vulnerabilities(
                &self.db,
                &candidate.detection.name,
                candidate.detection.version.as_deref(),
            )
        }))
        .await;

        let mut libraries = Vec::with_capacity(candidates.len());
        for (candidate, vulns) in candidates.into_iter().zip(vuln_lists) {
            let det = candidate.detection;

            let colocated: Vec<FindingType> = candidate
                .related_scripts
                .iter()
                .filter_map(|id| patterns_by_script.get(id))
                .flatten()
                .copied()
                .collect();

            let risk_score = risk::advanced_library_risk(
                &det.name,
                &vulns,
                det.confidence,
                &colocated,
                None,
            );

            libraries.push(Library {
                id: Uuid::new_v4(),
                scan_id,
                name: det.name,
                detected_version: det.version,
                related_scripts: candidate.related_scripts,
                vulnerabilities: vulns,
                risk_score,
                confidence: det.confidence,
                detection_method: det.method,
            });
        }

        libraries.sort_by(|a, b| b.risk_score.cmp(&a.risk_score).then(a.name.cmp(&b.name)));
        libraries
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_slots_are_exclusive_per_scan() {
        let slots = ProcessingSlots::default();
        let id = Uuid::new_v4();
        assert!(slots.try_acquire(id));
        assert!(!slots.try_acquire(id));
        assert!(slots.try_acquire(Uuid::new_v4()));
        slots.release(id);
        assert!(slots.try_acquire(id));
    }

    #[test]
    fn fingerprint_is_stable_sha256_hex() {
        let fp = fingerprint(b"var a = 1;");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(b"var a = 1;"));
        assert_ne!(fp, fingerprint(b"var a = 2;"));
    }
}
