// Job records and the per-job state machine:
// waiting -> active -> {completed | failed}; failed re-enters waiting (via
// delayed) with exponential backoff until attempts reach max_attempts, after
// which the job moves to the dead-letter queue.

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead-letter",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::DeadLetter
        )
    }
}

/// Worker-reported outcome, stored on the job record. A job can complete
/// with `success = false` (the work ran but the scan failed); the status
/// overlay maps that to a failed scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl JobResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            data,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: serde_json::Value::Null,
        }
    }
}

/// Parameters for a job about to be enqueued.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_ms: u64,
    pub priority: i32,
    pub delay_ms: u64,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            timeout_ms: 600_000,
            priority: 0,
            delay_ms: 0,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Attempts made so far (incremented when the job goes active).
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_ms: u64,
    pub priority: i32,
    pub state: JobState,
    /// 0-100, worker-reported. Readers may observe stale values.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stalled_count: u32,
    /// Epoch millis when a delayed job becomes due.
    pub ready_at_ms: i64,
    pub enqueued_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
}

impl Job {
    pub fn from_spec(queue: &str, spec: JobSpec) -> Self {
        let now = now_ms();
        let delayed = spec.delay_ms > 0;
        Self {
            id: spec.id,
            queue: queue.to_string(),
            payload: spec.payload,
            attempts: 0,
            max_attempts: spec.max_attempts,
            backoff_base_ms: spec.backoff_base_ms,
            timeout_ms: spec.timeout_ms,
            priority: spec.priority,
            state: if delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            progress: 0,
            result: None,
            last_error: None,
            stalled_count: 0,
            ready_at_ms: now + spec.delay_ms as i64,
            enqueued_at_ms: now,
            started_at_ms: None,
            finished_at_ms: None,
        }
    }

    /// Dead-letter id for this job: `dl-{jobId}-{timestamp}`.
    pub fn dead_letter_id(&self) -> String {
        format!("dl-{}-{}", self.id, now_ms())
    }
}

/// Retry n (1-based) waits `base * 2^(n-1)` milliseconds.
pub fn backoff_delay_ms(base_ms: u64, retry: u32) -> u64 {
    if retry == 0 {
        return 0;
    }
    base_ms.saturating_mul(1u64.checked_shl(retry - 1).unwrap_or(u64::MAX))
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential() {
        assert_eq!(backoff_delay_ms(2000, 1), 2000);
        assert_eq!(backoff_delay_ms(2000, 2), 4000);
        assert_eq!(backoff_delay_ms(2000, 3), 8000);
        assert_eq!(backoff_delay_ms(2000, 4), 16000);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        assert_eq!(backoff_delay_ms(2000, 0), 0);
        let huge = backoff_delay_ms(u64::MAX, 10);
        assert_eq!(huge, u64::MAX);
        let shifted_out = backoff_delay_ms(1, 100);
        assert_eq!(shifted_out, u64::MAX);
    }

    #[test]
    fn spec_defaults_apply() {
        let job = Job::from_spec("scan-queue", JobSpec::new("j1", serde_json::json!({"a": 1})));
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn delayed_spec_starts_delayed() {
        let job = Job::from_spec(
            "scan-queue",
            JobSpec::new("j2", serde_json::Value::Null).delay_ms(5_000),
        );
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.ready_at_ms > job.enqueued_at_ms);
    }

    #[test]
    fn dead_letter_id_embeds_job_id() {
        let job = Job::from_spec("q", JobSpec::new("scan-123", serde_json::Value::Null));
        assert!(job.dead_letter_id().starts_with("dl-scan-123-"));
    }
}
