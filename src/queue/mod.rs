// Durable two-queue job system: `scan-queue` feeds the render worker,
// `analysis-queue` feeds the analyze worker. Retries with exponential
// backoff, delayed jobs, stall detection and a dead-letter queue, all over a
// pluggable store (Redis in production, in-memory in tests).

pub mod job;
pub mod metrics;
pub mod redis_store;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

pub use job::{backoff_delay_ms, now_ms, Job, JobResult, JobSpec, JobState};
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use redis_store::RedisQueueStore;
pub use store::{InMemoryQueueStore, QueueCounts, QueueError, QueueStore};

pub const SCAN_QUEUE: &str = "scan-queue";
pub const ANALYSIS_QUEUE: &str = "analysis-queue";

/// Bound on individual store operations (spec: queue ops 5 s).
const STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence while waiting for another queue's job to finish.
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Worker lease TTL; a job whose holder stops heartbeating within this
    /// window is considered stalled.
    pub stalled_interval_ms: i64,
    /// Stalls tolerated before the job is dead-lettered outright.
    pub max_stalled_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            stalled_interval_ms: 30_000,
            max_stalled_count: 2,
        }
    }
}

/// One logical queue bound to a shared store.
pub struct JobQueue {
    name: &'static str,
    store: Arc<dyn QueueStore>,
    settings: QueueSettings,
    metrics: Arc<QueueMetrics>,
}

impl JobQueue {
    pub fn new(name: &'static str, store: Arc<dyn QueueStore>, settings: QueueSettings) -> Self {
        Self {
            name,
            store,
            settings,
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn metrics(&self) -> Arc<QueueMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        tokio::time::timeout(STORE_OP_TIMEOUT, fut)
            .await
            .map_err(|_| QueueError::Timeout(format!("{} store operation", self.name)))?
    }

    /// Enqueue a job. Returns false when a job with the same id is already
    /// pending or running (job-id based dedup); terminal jobs are replaced.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<bool, QueueError> {
        if let Some(existing) = self.bounded(self.store.load_job(self.name, &spec.id)).await? {
            if !existing.state.is_finished() {
                tracing::debug!(
                    "Job {} already {} on {}, skipping enqueue",
                    spec.id,
                    existing.state.as_str(),
                    self.name
                );
                return Ok(false);
            }
        }

        let job = Job::from_spec(self.name, spec);
        self.bounded(self.store.save_job(&job)).await?;
        match job.state {
            JobState::Delayed => {
                self.bounded(self.store.push_delayed(self.name, &job.id, job.ready_at_ms))
                    .await?;
            }
            _ => {
                self.bounded(self.store.push_waiting(self.name, &job.id, job.priority))
                    .await?;
            }
        }
        tracing::info!("Enqueued job {} on {}", job.id, self.name);
        Ok(true)
    }

    /// Move due delayed jobs back to waiting.
    pub async fn promote_due(&self) -> Result<(), QueueError> {
        let due = self.bounded(self.store.due_delayed(self.name, now_ms())).await?;
        for id in due {
            self.bounded(self.store.remove_delayed(self.name, &id)).await?;
            if let Some(mut job) = self.bounded(self.store.load_job(self.name, &id)).await? {
                job.state = JobState::Waiting;
                self.bounded(self.store.save_job(&job)).await?;
                self.bounded(self.store.push_waiting(self.name, &id, job.priority))
                    .await?;
            }
        }
        Ok(())
    }

    /// Fetch the next runnable job, acquiring its lease. Returns None when
    /// the queue is empty.
    pub async fn fetch_next(&self) -> Result<Option<Job>, QueueError> {
        self.promote_due().await?;

        loop {
            let Some(id) = self.bounded(self.store.pop_waiting(self.name)).await? else {
                return Ok(None);
            };

            let Some(mut job) = self.bounded(self.store.load_job(self.name, &id)).await? else {
                tracing::warn!("Waiting id {} on {} has no job record", id, self.name);
                continue;
            };

            if !self
                .bounded(
                    self.store
                        .acquire_lease(self.name, &id, self.settings.stalled_interval_ms),
                )
                .await?
            {
                // Another holder is still live; leave the job to the sweeper.
                tracing::warn!("Lease for {} on {} is held elsewhere", id, self.name);
                continue;
            }

            job.attempts += 1;
            job.state = JobState::Active;
            job.started_at_ms = Some(now_ms());
            self.bounded(self.store.save_job(&job)).await?;
            self.bounded(self.store.add_active(self.name, &id)).await?;
            return Ok(Some(job));
        }
    }

    /// Heartbeat: renew the lease and optionally report progress.
    pub async fn heartbeat(&self, id: &str, progress: Option<u8>) -> Result<(), QueueError> {
        self.bounded(
            self.store
                .renew_lease(self.name, id, self.settings.stalled_interval_ms),
        )
        .await?;
        if let Some(p) = progress {
            self.update_progress(id, p).await?;
        }
        Ok(())
    }

    pub async fn update_progress(&self, id: &str, progress: u8) -> Result<(), QueueError> {
        if let Some(mut job) = self.bounded(self.store.load_job(self.name, id)).await? {
            job.progress = progress.min(100);
            self.bounded(self.store.save_job(&job)).await?;
        }
        Ok(())
    }

    /// Mark a job completed with its worker-reported result.
    pub async fn complete(&self, id: &str, result: JobResult) -> Result<(), QueueError> {
        let Some(mut job) = self.bounded(self.store.load_job(self.name, id)).await? else {
            return Err(QueueError::NotFound(id.to_string()));
        };

        job.state = JobState::Completed;
        job.progress = 100;
        job.result = Some(result);
        job.finished_at_ms = Some(now_ms());
        if let (Some(start), Some(finish)) = (job.started_at_ms, job.finished_at_ms) {
            self.metrics.record_completed((finish - start).max(0) as u64);
        }
        self.bounded(self.store.save_job(&job)).await?;
        self.bounded(self.store.remove_active(self.name, id)).await?;
        self.bounded(self.store.release_lease(self.name, id)).await?;
        Ok(())
    }

    /// Record a failed attempt: schedule a backoff retry, or dead-letter the
    /// job when attempts are exhausted.
    pub async fn fail(&self, id: &str, error: &str) -> Result<(), QueueError> {
        let Some(mut job) = self.bounded(self.store.load_job(self.name, id)).await? else {
            return Err(QueueError::NotFound(id.to_string()));
        };

        job.last_error = Some(error.to_string());
        self.bounded(self.store.remove_active(self.name, id)).await?;
        self.bounded(self.store.release_lease(self.name, id)).await?;

        if job.attempts < job.max_attempts {
            let delay = backoff_delay_ms(job.backoff_base_ms, job.attempts);
            job.state = JobState::Delayed;
            job.ready_at_ms = now_ms() + delay as i64;
            self.bounded(self.store.save_job(&job)).await?;
            self.bounded(self.store.push_delayed(self.name, id, job.ready_at_ms))
                .await?;
            self.metrics.record_retry();
            tracing::warn!(
                "Job {} on {} failed (attempt {}/{}), retrying in {}ms: {}",
                id,
                self.name,
                job.attempts,
                job.max_attempts,
                delay,
                error
            );
        } else {
            job.state = JobState::DeadLetter;
            job.finished_at_ms = Some(now_ms());
            self.bounded(self.store.save_job(&job)).await?;

            let mut entry = job.clone();
            entry.id = job.dead_letter_id();
            self.bounded(self.store.push_dead_letter(self.name, &entry))
                .await?;
            self.metrics.record_failed();
            tracing::error!(
                "Job {} on {} exhausted {} attempts, dead-lettered: {}",
                id,
                self.name,
                job.max_attempts,
                error
            );
        }
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.bounded(self.store.load_job(self.name, id)).await
    }

    pub async fn dead_letter_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.bounded(self.store.list_dead_letter(self.name)).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.bounded(self.store.counts(self.name)).await
    }

    /// Re-queue active jobs whose lease expired. Bounded by
    /// `max_stalled_count`, beyond which the job is dead-lettered.
    pub async fn sweep_stalled(&self) -> Result<(), QueueError> {
        let active = self.bounded(self.store.list_active(self.name)).await?;
        for id in active {
            if self.bounded(self.store.lease_alive(self.name, &id)).await? {
                continue;
            }
            let Some(mut job) = self.bounded(self.store.load_job(self.name, &id)).await? else {
                self.bounded(self.store.remove_active(self.name, &id)).await?;
                continue;
            };
            if job.state != JobState::Active {
                self.bounded(self.store.remove_active(self.name, &id)).await?;
                continue;
            }

            job.stalled_count += 1;
            self.bounded(self.store.remove_active(self.name, &id)).await?;

            if job.stalled_count > self.settings.max_stalled_count {
                job.state = JobState::DeadLetter;
                job.last_error = Some("job stalled too many times".to_string());
                job.finished_at_ms = Some(now_ms());
                self.bounded(self.store.save_job(&job)).await?;
                let mut entry = job.clone();
                entry.id = job.dead_letter_id();
                self.bounded(self.store.push_dead_letter(self.name, &entry))
                    .await?;
                self.metrics.record_failed();
                tracing::error!("Stalled job {} on {} dead-lettered", id, self.name);
            } else {
                job.state = JobState::Waiting;
                self.bounded(self.store.save_job(&job)).await?;
                self.bounded(self.store.push_waiting(self.name, &id, job.priority))
                    .await?;
                tracing::warn!(
                    "Stalled job {} on {} re-queued (stall {}/{})",
                    id,
                    self.name,
                    job.stalled_count,
                    self.settings.max_stalled_count
                );
            }
        }
        Ok(())
    }

    /// Poll until the job reaches a finished state or the deadline passes.
    pub async fn wait_for_finished(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.get_job(id).await? {
                if job.state.is_finished() {
                    return Ok(Some(job));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(FINISH_POLL_INTERVAL).await;
        }
    }

    /// Health check: ping the store and list waiting, each bounded by the
    /// 5 s store-operation timeout.
    pub async fn health_check(&self) -> Result<QueueCounts, QueueError> {
        self.bounded(self.store.ping()).await?;
        self.counts().await
    }

    pub fn metrics_snapshot(&self, counts: QueueCounts) -> MetricsSnapshot {
        self.metrics.snapshot(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue_on(store: Arc<dyn QueueStore>, name: &'static str) -> JobQueue {
        JobQueue::new(name, store, QueueSettings::default())
    }

    fn fast_retry_spec(id: &str, max_attempts: u32) -> JobSpec {
        JobSpec::new(id, json!({"scanId": id}))
            .max_attempts(max_attempts)
            .backoff_base_ms(0)
    }

    #[tokio::test]
    async fn enqueue_fetch_complete_lifecycle() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = queue_on(store, SCAN_QUEUE);

        assert!(queue
            .enqueue(JobSpec::new("scan-1", json!({"url": "https://example.com"})))
            .await
            .unwrap());

        let job = queue.fetch_next().await.unwrap().expect("job available");
        assert_eq!(job.id, "scan-1");
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);

        queue.update_progress("scan-1", 40).await.unwrap();
        assert_eq!(queue.get_job("scan-1").await.unwrap().unwrap().progress, 40);

        queue
            .complete("scan-1", JobResult::ok(json!({"done": true})))
            .await
            .unwrap();
        let done = queue.get_job("scan-1").await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.result.as_ref().unwrap().success);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_deduplicated() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = queue_on(store, SCAN_QUEUE);

        assert!(queue
            .enqueue(JobSpec::new("scan-1", json!({})))
            .await
            .unwrap());
        assert!(!queue
            .enqueue(JobSpec::new("scan-1", json!({})))
            .await
            .unwrap());

        // After the job finishes a re-enqueue is allowed again.
        queue.fetch_next().await.unwrap().unwrap();
        queue
            .complete("scan-1", JobResult::ok(serde_json::Value::Null))
            .await
            .unwrap();
        assert!(queue
            .enqueue(JobSpec::new("scan-1", json!({})))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_dlq_exactly_once() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = queue_on(store, SCAN_QUEUE);

        let payload = json!({"scanId": "scan-x", "url": "https://example.com"});
        queue
            .enqueue(
                JobSpec::new("scan-x", payload.clone())
                    .max_attempts(3)
                    .backoff_base_ms(0),
            )
            .await
            .unwrap();

        for attempt in 1..=3 {
            let job = queue.fetch_next().await.unwrap().expect("job runnable");
            assert_eq!(job.attempts, attempt);
            queue.fail("scan-x", "browser crashed").await.unwrap();
        }

        // No further attempts are runnable.
        assert!(queue.fetch_next().await.unwrap().is_none());

        let dlq = queue.dead_letter_jobs().await.unwrap();
        assert_eq!(dlq.len(), 1);
        let entry = &dlq[0];
        assert!(entry.id.starts_with("dl-scan-x-"));
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.max_attempts, 3);
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.last_error.as_deref(), Some("browser crashed"));

        let job = queue.get_job("scan-x").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
    }

    #[tokio::test]
    async fn failed_job_is_retried_after_backoff() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = queue_on(store, SCAN_QUEUE);

        queue.enqueue(fast_retry_spec("scan-r", 2)).await.unwrap();
        queue.fetch_next().await.unwrap().unwrap();
        queue.fail("scan-r", "transient").await.unwrap();

        let delayed = queue.get_job("scan-r").await.unwrap().unwrap();
        assert_eq!(delayed.state, JobState::Delayed);

        // Zero backoff means it is immediately due.
        let retried = queue.fetch_next().await.unwrap().expect("retry runnable");
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn queues_share_a_store_without_interference() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let scans = queue_on(Arc::clone(&store), SCAN_QUEUE);
        let analyses = queue_on(store, ANALYSIS_QUEUE);

        scans.enqueue(JobSpec::new("id-1", json!(1))).await.unwrap();
        analyses
            .enqueue(JobSpec::new("id-1", json!(2)))
            .await
            .unwrap();

        let scan_job = scans.fetch_next().await.unwrap().unwrap();
        let analysis_job = analyses.fetch_next().await.unwrap().unwrap();
        assert_eq!(scan_job.payload, json!(1));
        assert_eq!(analysis_job.payload, json!(2));
    }

    #[tokio::test]
    async fn stalled_job_is_requeued_then_dead_lettered() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        // Lease TTL of zero: every active job is immediately stalled.
        let queue = JobQueue::new(
            SCAN_QUEUE,
            store,
            QueueSettings {
                stalled_interval_ms: 0,
                max_stalled_count: 1,
            },
        );

        queue.enqueue(fast_retry_spec("scan-s", 5)).await.unwrap();

        // First stall: re-queued.
        queue.fetch_next().await.unwrap().unwrap();
        queue.sweep_stalled().await.unwrap();
        let job = queue.get_job("scan-s").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.stalled_count, 1);

        // Second stall exceeds max_stalled_count: dead-lettered.
        queue.fetch_next().await.unwrap().unwrap();
        queue.sweep_stalled().await.unwrap();
        let job = queue.get_job("scan-s").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
        assert_eq!(queue.dead_letter_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_finished_sees_completion() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = Arc::new(queue_on(store, ANALYSIS_QUEUE));

        queue.enqueue(JobSpec::new("an-1", json!({}))).await.unwrap();
        queue.fetch_next().await.unwrap().unwrap();

        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_finished("an-1", Duration::from_secs(5))
                .await
        });

        queue
            .complete("an-1", JobResult::ok(serde_json::Value::Null))
            .await
            .unwrap();

        let finished = handle.await.unwrap().unwrap().expect("finished job");
        assert_eq!(finished.state, JobState::Completed);
    }

    #[tokio::test]
    async fn wait_for_finished_times_out() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = queue_on(store, ANALYSIS_QUEUE);
        queue.enqueue(JobSpec::new("an-2", json!({}))).await.unwrap();

        let got = queue
            .wait_for_finished("an-2", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn metrics_track_outcomes() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let queue = queue_on(store, SCAN_QUEUE);

        queue.enqueue(fast_retry_spec("m-1", 1)).await.unwrap();
        queue.fetch_next().await.unwrap().unwrap();
        queue.fail("m-1", "boom").await.unwrap();

        queue.enqueue(JobSpec::new("m-2", json!({}))).await.unwrap();
        queue.fetch_next().await.unwrap().unwrap();
        queue
            .complete("m-2", JobResult::ok(serde_json::Value::Null))
            .await
            .unwrap();

        let counts = queue.counts().await.unwrap();
        let snap = queue.metrics_snapshot(counts);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.dead_letter, 1);
    }
}
