// Queue metrics: rolling state counts, a processing-time ring buffer over
// the last ~500 completions, and hourly windows for throughput / error rate
// / retry rate. One mutex-guarded owner serializes updates; readers get
// snapshots.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use super::store::QueueCounts;

/// Ring buffer capacity for processing times.
const PROCESSING_TIME_SAMPLES: usize = 500;

/// Hourly windows retained.
const HOURLY_WINDOWS: usize = 24;

#[derive(Debug, Default, Clone, Serialize)]
pub struct HourlyWindow {
    /// Hour bucket, epoch seconds truncated to the hour.
    pub hour: i64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    completed: u64,
    failed: u64,
    retried: u64,
    processing_times_ms: VecDeque<u64>,
    hourly: VecDeque<HourlyWindow>,
}

impl MetricsInner {
    fn current_hour(&mut self) -> &mut HourlyWindow {
        let hour = Utc::now().timestamp() / 3600 * 3600;
        let needs_new = self.hourly.back().map(|w| w.hour != hour).unwrap_or(true);
        if needs_new {
            self.hourly.push_back(HourlyWindow {
                hour,
                ..Default::default()
            });
            while self.hourly.len() > HOURLY_WINDOWS {
                self.hourly.pop_front();
            }
        }
        self.hourly.back_mut().expect("window just pushed")
    }
}

#[derive(Default)]
pub struct QueueMetrics {
    inner: Mutex<MetricsInner>,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&self, processing_time_ms: u64) {
        let mut inner = self.inner.lock().expect("metrics mutex");
        inner.completed += 1;
        inner.processing_times_ms.push_back(processing_time_ms);
        while inner.processing_times_ms.len() > PROCESSING_TIME_SAMPLES {
            inner.processing_times_ms.pop_front();
        }
        inner.current_hour().processed += 1;
    }

    pub fn record_failed(&self) {
        let mut inner = self.inner.lock().expect("metrics mutex");
        inner.failed += 1;
        inner.current_hour().failed += 1;
    }

    pub fn record_retry(&self) {
        let mut inner = self.inner.lock().expect("metrics mutex");
        inner.retried += 1;
        inner.current_hour().retried += 1;
    }

    pub fn snapshot(&self, counts: QueueCounts) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics mutex");
        let avg = if inner.processing_times_ms.is_empty() {
            0.0
        } else {
            inner.processing_times_ms.iter().sum::<u64>() as f64
                / inner.processing_times_ms.len() as f64
        };
        MetricsSnapshot {
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            dead_letter: counts.dead_letter,
            completed: inner.completed,
            failed: inner.failed,
            retried: inner.retried,
            avg_processing_time_ms: avg,
            hourly: inner.hourly.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub dead_letter: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_processing_time_ms: f64,
    pub hourly: Vec<HourlyWindow>,
}
