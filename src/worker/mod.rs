// Worker runtime: fixed pools of render and analyze slots polling their
// queues, plus the stall sweeper. Shutdown stops intake, waits for active
// tasks up to a grace period, then force-terminates.

pub mod analyze;
pub mod render;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db;
use crate::error::AppError;
use crate::queue::{JobQueue, JobResult, JobState};
use crate::renderer::Renderer;
use crate::storage::ArtifactStore;
use crate::vuln::VulnService;

use analyze::AnalyzeWorker;
use render::RenderWorker;
use tasks::TaskResult;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(750);
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct WorkerRuntime {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    /// Spawn the render pool, analyze pool and the per-queue stall sweepers.
    pub fn spawn(
        db: PgPool,
        scan_queue: Arc<JobQueue>,
        analysis_queue: Arc<JobQueue>,
        artifacts: Arc<dyn ArtifactStore>,
        vuln: Arc<VulnService>,
        config: Arc<Config>,
    ) -> Result<Self, AppError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let render_worker = Arc::new(RenderWorker {
            db: db.clone(),
            scan_queue: Arc::clone(&scan_queue),
            analysis_queue: Arc::clone(&analysis_queue),
            artifacts: Arc::clone(&artifacts),
            renderer: Renderer::new()?,
            config: Arc::clone(&config),
        });

        for slot in 0..config.render_concurrency.max(1) {
            let worker = Arc::clone(&render_worker);
            let queue = Arc::clone(&scan_queue);
            let pool = db.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_slot(format!("render-{}", slot), queue, pool, rx, move |payload| {
                    let worker = Arc::clone(&worker);
                    async move { worker.process(payload).await }
                })
                .await;
            }));
        }

        let analyze_worker = Arc::new(AnalyzeWorker::new(
            db.clone(),
            Arc::clone(&analysis_queue),
            Arc::clone(&artifacts),
            vuln,
        ));

        for slot in 0..config.analyze_concurrency.max(1) {
            let worker = Arc::clone(&analyze_worker);
            let queue = Arc::clone(&analysis_queue);
            let pool = db.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_slot(format!("analyze-{}", slot), queue, pool, rx, move |payload| {
                    let worker = Arc::clone(&worker);
                    async move { worker.process(payload).await }
                })
                .await;
            }));
        }

        for queue in [Arc::clone(&scan_queue), Arc::clone(&analysis_queue)] {
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_sweeper(queue, rx).await;
            }));
        }

        tracing::info!(
            "Worker runtime started: {} render slot(s), {} analyze slot(s)",
            config.render_concurrency.max(1),
            config.analyze_concurrency.max(1)
        );

        Ok(Self {
            shutdown_tx,
            handles,
        })
    }

    /// Graceful shutdown: signal all slots, then wait up to the grace
    /// period before aborting what remains.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Worker shutdown grace period elapsed, force-terminating");
        }
        tracing::info!("Worker runtime stopped");
    }
}

/// One worker slot: poll, process with the job's wall-clock timeout, report
/// the outcome, repeat until shutdown.
async fn run_slot<F, Fut>(
    name: String,
    queue: Arc<JobQueue>,
    db: PgPool,
    mut shutdown: watch::Receiver<bool>,
    mut process: F,
) where
    F: FnMut(serde_json::Value) -> Fut,
    Fut: std::future::Future<Output = Result<TaskResult, AppError>>,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = match queue.fetch_next().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            Err(e) => {
                tracing::warn!("[{}] queue fetch failed: {}", name, e);
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }
        };

        let job_id = job.id.clone();
        let timeout = Duration::from_millis(job.timeout_ms.max(1_000));
        tracing::info!("[{}] processing job {} (attempt {})", name, job_id, job.attempts);

        let outcome = tokio::time::timeout(timeout, process(job.payload.clone())).await;

        match outcome {
            Ok(Ok(result)) => {
                let success = result.success;
                let data = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
                let job_result = JobResult {
                    success,
                    error: None,
                    data,
                };
                if let Err(e) = queue.complete(&job_id, job_result).await {
                    tracing::error!("[{}] failed to complete job {}: {}", name, job_id, e);
                }
            }
            Ok(Err(e)) => {
                handle_job_failure(&name, &queue, &db, &job_id, &e.to_string()).await;
            }
            Err(_) => {
                handle_job_failure(&name, &queue, &db, &job_id, "Processing timeout").await;
            }
        }
    }
    tracing::info!("[{}] worker slot stopped", name);
}

/// Record the failure on the queue; once the job dead-letters, the scan row
/// gets its terminal failure status (retries leave it running).
async fn handle_job_failure(name: &str, queue: &JobQueue, db: &PgPool, job_id: &str, error: &str) {
    tracing::warn!("[{}] job {} failed: {}", name, job_id, error);
    if let Err(e) = queue.fail(job_id, error).await {
        tracing::error!("[{}] failed to record failure for {}: {}", name, job_id, e);
        return;
    }

    let dead = matches!(
        queue.get_job(job_id).await,
        Ok(Some(job)) if job.state == JobState::DeadLetter
    );
    if dead {
        if let Ok(scan_id) = uuid::Uuid::parse_str(job_id) {
            if let Err(e) = db::scans::mark_failed(db, scan_id, error).await {
                tracing::error!("Failed to mark scan {} failed: {}", scan_id, e);
            }
        }
    }
}

async fn run_sweeper(queue: Arc<JobQueue>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if let Err(e) = queue.sweep_stalled().await {
            tracing::warn!("Stall sweep on {} failed: {}", queue.name(), e);
        }
        if let Err(e) = queue.promote_due().await {
            tracing::warn!("Delayed promotion on {} failed: {}", queue.name(), e);
        }
    }
}
