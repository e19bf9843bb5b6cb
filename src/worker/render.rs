// Render worker: renders the target page, stores artifacts, dispatches the
// analysis job and waits for it to finish. Progress milestones 10/40/70/85/
// 100 are reported on the scan-queue job.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::Config;
use crate::db;
use crate::error::AppError;
use crate::queue::{JobQueue, JobSpec, JobState};
use crate::renderer::{self, Renderer};
use crate::storage::{self, ArtifactStore};

use super::tasks::{AnalysisTask, ArtifactRefs, ScanTask, ScriptArtifact, TaskResult};

/// Extra wall-clock granted to the analysis stage on top of the scan's own
/// timeout while the render worker waits for it.
const ANALYSIS_WAIT_SLACK: Duration = Duration::from_secs(120);

const SCRIPT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const SOURCE_MAP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RenderWorker {
    pub db: PgPool,
    pub scan_queue: Arc<JobQueue>,
    pub analysis_queue: Arc<JobQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub renderer: Renderer,
    pub config: Arc<Config>,
}

impl RenderWorker {
    pub async fn process(&self, payload: serde_json::Value) -> Result<TaskResult, AppError> {
        let task: ScanTask = serde_json::from_value(payload)?;
        let scan_id = task.scan_id;
        let job_id = scan_id.to_string();

        db::scans::mark_running(&self.db, scan_id).await?;
        self.scan_queue.heartbeat(&job_id, Some(10)).await.ok();

        // The SSRF policy runs again inside the fetcher for every request
        // the render makes, including redirect hops and crawled pages.
        let mut outcome = self.renderer.render(&task.url, &task.parameters).await?;

        self.scan_queue.heartbeat(&job_id, Some(40)).await.ok();

        // DOM snapshot artifact.
        let snapshot_key = storage::dom_snapshot_key(scan_id);
        self.artifacts
            .put(&snapshot_key, outcome.html.as_bytes())
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        // External script bodies, bounded by the configured cap. Failures
        // store an empty blob and are recorded in fetch_errors.
        let mut fetch_errors: Vec<String> = Vec::new();
        let mut script_artifacts: Vec<ScriptArtifact> = Vec::new();
        let max_scripts = self.config.renderer_max_external_scripts;

        for (i, script) in outcome.external_scripts.iter().take(max_scripts).enumerate() {
            let key = storage::external_script_key(scan_id, i);
            let (body, fetch_failed) = match self
                .renderer
                .fetcher()
                .fetch_with_retry(&script.url, &task.parameters.headers, SCRIPT_FETCH_TIMEOUT)
                .await
            {
                Ok(response) => (response.body, false),
                Err(e) => {
                    fetch_errors.push(format!("{}: {}", script.url, e));
                    (Vec::new(), true)
                }
            };

            // Source maps referenced by the body are fetched now so the
            // analyzer can stay fully offline.
            if !fetch_failed {
                let body_text = String::from_utf8_lossy(&body);
                if let Some(map_url) = renderer::source_map_url(&body_text, &script.url) {
                    if !outcome.source_maps.contains_key(map_url.as_str()) {
                        match self
                            .renderer
                            .fetcher()
                            .fetch(map_url.as_str(), &task.parameters.headers, SOURCE_MAP_FETCH_TIMEOUT)
                            .await
                        {
                            Ok(map) => {
                                outcome
                                    .source_maps
                                    .insert(map_url.to_string(), map.body_string());
                            }
                            Err(e) => {
                                tracing::debug!("Source map fetch of {} failed: {}", map_url, e);
                            }
                        }
                    }
                }
            }

            self.artifacts
                .put(&key, &body)
                .await
                .map_err(|e| AppError::Storage(e.to_string()))?;
            script_artifacts.push(ScriptArtifact {
                url: script.url.clone(),
                key,
                fetch_failed,
            });

            self.scan_queue.heartbeat(&job_id, None).await.ok();
        }

        if outcome.external_scripts.len() > max_scripts {
            tracing::warn!(
                "Scan {} has {} external scripts, analyzing first {}",
                scan_id,
                outcome.external_scripts.len(),
                max_scripts
            );
        }

        // Network trace artifact.
        let trace_key = storage::network_trace_key(scan_id);
        let trace_json = serde_json::to_vec(&outcome.resources)?;
        self.artifacts
            .put(&trace_key, &trace_json)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        let artifacts = ArtifactRefs {
            dom_snapshot: snapshot_key,
            scripts: script_artifacts,
            network_trace: Some(trace_key),
        };

        let artifact_paths = serde_json::to_value(&artifacts)?;
        db::scans::update_artifact_paths(&self.db, scan_id, &artifact_paths).await?;

        self.scan_queue.heartbeat(&job_id, Some(70)).await.ok();

        // Dispatch analysis; jobId == scanId gives queue-level dedup.
        let analysis_task = AnalysisTask {
            scan_id,
            artifacts: artifacts.clone(),
            dom_analysis: outcome,
            fetch_errors,
        };
        self.analysis_queue
            .enqueue(
                JobSpec::new(job_id.clone(), serde_json::to_value(&analysis_task)?)
                    .max_attempts(3)
                    .backoff_base_ms(self.config.queue_retry_delay)
                    .timeout_ms(self.config.queue_job_timeout),
            )
            .await
            .map_err(|e| AppError::Queue(e.to_string()))?;

        self.scan_queue.heartbeat(&job_id, Some(85)).await.ok();

        // Wait for the analysis job, heartbeating our own lease meanwhile.
        let wait_budget =
            Duration::from_secs(task.parameters.timeout.max(30)) + ANALYSIS_WAIT_SLACK;
        let analysis_job = self.await_analysis(scan_id, &job_id, wait_budget).await?;

        let success = match analysis_job.state {
            JobState::Completed => analysis_job
                .result
                .as_ref()
                .map(|r| r.success)
                .unwrap_or(false),
            _ => false,
        };

        if !success && analysis_job.state != JobState::Completed {
            // Analysis exhausted its retries; its worker already recorded
            // the scan failure, this is just the render job's verdict.
            tracing::error!(
                "Analysis for scan {} ended in state {}",
                scan_id,
                analysis_job.state.as_str()
            );
        }

        self.scan_queue.heartbeat(&job_id, Some(100)).await.ok();

        Ok(TaskResult {
            scan_id,
            success,
            artifacts: Some(artifacts),
        })
    }

    /// Poll the analysis job to a finished state within the budget,
    /// renewing this worker's scan-queue lease as it waits.
    async fn await_analysis(
        &self,
        scan_id: uuid::Uuid,
        job_id: &str,
        budget: Duration,
    ) -> Result<crate::queue::Job, AppError> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if let Some(job) = self
                .analysis_queue
                .get_job(job_id)
                .await
                .map_err(|e| AppError::Queue(e.to_string()))?
            {
                if job.state.is_finished() {
                    return Ok(job);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                db::scans::mark_failed(&self.db, scan_id, "Analysis job timeout")
                    .await
                    .ok();
                return Err(AppError::Timeout("Analysis job timeout".to_string()));
            }

            self.scan_queue.heartbeat(job_id, None).await.ok();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
