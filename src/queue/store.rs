// Queue store abstraction. The Redis implementation backs production; the
// in-memory implementation backs the test suite and drives the same state
// machine through the same trait.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use super::job::{now_ms, Job};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue operation timed out: {0}")]
    Timeout(String),

    #[error("job not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub dead_letter: u64,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn ping(&self) -> Result<(), QueueError>;

    async fn save_job(&self, job: &Job) -> Result<(), QueueError>;
    async fn load_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError>;
    async fn delete_job(&self, queue: &str, id: &str) -> Result<(), QueueError>;

    /// Append to the waiting set. Equal priorities are FIFO by enqueue order.
    async fn push_waiting(&self, queue: &str, id: &str, priority: i32) -> Result<(), QueueError>;
    async fn pop_waiting(&self, queue: &str) -> Result<Option<String>, QueueError>;

    async fn push_delayed(&self, queue: &str, id: &str, ready_at_ms: i64) -> Result<(), QueueError>;
    /// Ids whose ready time has passed.
    async fn due_delayed(&self, queue: &str, now_ms: i64) -> Result<Vec<String>, QueueError>;
    async fn remove_delayed(&self, queue: &str, id: &str) -> Result<(), QueueError>;

    /// Lease acquisition is the at-most-one-active guarantee: the call
    /// succeeds for exactly one holder until the lease expires or is
    /// released.
    async fn acquire_lease(&self, queue: &str, id: &str, ttl_ms: i64) -> Result<bool, QueueError>;
    async fn renew_lease(&self, queue: &str, id: &str, ttl_ms: i64) -> Result<bool, QueueError>;
    async fn release_lease(&self, queue: &str, id: &str) -> Result<(), QueueError>;
    async fn lease_alive(&self, queue: &str, id: &str) -> Result<bool, QueueError>;

    async fn add_active(&self, queue: &str, id: &str) -> Result<(), QueueError>;
    async fn remove_active(&self, queue: &str, id: &str) -> Result<(), QueueError>;
    async fn list_active(&self, queue: &str) -> Result<Vec<String>, QueueError>;

    async fn push_dead_letter(&self, queue: &str, entry: &Job) -> Result<(), QueueError>;
    async fn list_dead_letter(&self, queue: &str) -> Result<Vec<Job>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;
}

// ============================================
// In-memory store
// ============================================

#[derive(Default)]
struct QueueData {
    jobs: HashMap<String, Job>,
    /// (priority, seq) -> id. BTreeMap iteration order is the pop order.
    waiting: BTreeMap<(i64, u64), String>,
    /// (ready_at_ms, id)
    delayed: BTreeMap<(i64, String), ()>,
    active: HashSet<String>,
    /// id -> lease expiry (epoch ms)
    leases: HashMap<String, i64>,
    dead_letter: Vec<Job>,
    seq: u64,
}

/// Process-local queue store. Used by the test suite; also handy for
/// development without a Redis instance.
#[derive(Default)]
pub struct InMemoryQueueStore {
    inner: Mutex<HashMap<String, QueueData>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, queue: &str, f: impl FnOnce(&mut QueueData) -> R) -> R {
        let mut guard = self.inner.lock().expect("queue store mutex");
        let data = guard.entry(queue.to_string()).or_default();
        f(data)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
        self.with(&job.queue, |d| {
            d.jobs.insert(job.id.clone(), job.clone());
        });
        Ok(())
    }

    async fn load_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.with(queue, |d| d.jobs.get(id).cloned()))
    }

    async fn delete_job(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.jobs.remove(id);
        });
        Ok(())
    }

    async fn push_waiting(&self, queue: &str, id: &str, priority: i32) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.seq += 1;
            d.waiting.insert((priority as i64, d.seq), id.to_string());
        });
        Ok(())
    }

    async fn pop_waiting(&self, queue: &str) -> Result<Option<String>, QueueError> {
        Ok(self.with(queue, |d| {
            let key = d.waiting.keys().next().cloned()?;
            d.waiting.remove(&key)
        }))
    }

    async fn push_delayed(&self, queue: &str, id: &str, ready_at_ms: i64) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.delayed.insert((ready_at_ms, id.to_string()), ());
        });
        Ok(())
    }

    async fn due_delayed(&self, queue: &str, now_ms: i64) -> Result<Vec<String>, QueueError> {
        Ok(self.with(queue, |d| {
            d.delayed
                .keys()
                .filter(|(ready, _)| *ready <= now_ms)
                .map(|(_, id)| id.clone())
                .collect()
        }))
    }

    async fn remove_delayed(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.with(queue, |d| {
            let keys: Vec<_> = d
                .delayed
                .keys()
                .filter(|(_, jid)| jid == id)
                .cloned()
                .collect();
            for key in keys {
                d.delayed.remove(&key);
            }
        });
        Ok(())
    }

    async fn acquire_lease(&self, queue: &str, id: &str, ttl_ms: i64) -> Result<bool, QueueError> {
        let now = now_ms();
        Ok(self.with(queue, |d| {
            match d.leases.get(id) {
                Some(expiry) if *expiry > now => false,
                _ => {
                    d.leases.insert(id.to_string(), now + ttl_ms);
                    true
                }
            }
        }))
    }

    async fn renew_lease(&self, queue: &str, id: &str, ttl_ms: i64) -> Result<bool, QueueError> {
        let now = now_ms();
        Ok(self.with(queue, |d| match d.leases.get_mut(id) {
            Some(expiry) if *expiry > now => {
                *expiry = now + ttl_ms;
                true
            }
            _ => false,
        }))
    }

    async fn release_lease(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.leases.remove(id);
        });
        Ok(())
    }

    async fn lease_alive(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let now = now_ms();
        Ok(self.with(queue, |d| {
            d.leases.get(id).map(|e| *e > now).unwrap_or(false)
        }))
    }

    async fn add_active(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.active.insert(id.to_string());
        });
        Ok(())
    }

    async fn remove_active(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.active.remove(id);
        });
        Ok(())
    }

    async fn list_active(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        Ok(self.with(queue, |d| d.active.iter().cloned().collect()))
    }

    async fn push_dead_letter(&self, queue: &str, entry: &Job) -> Result<(), QueueError> {
        self.with(queue, |d| {
            d.dead_letter.push(entry.clone());
        });
        Ok(())
    }

    async fn list_dead_letter(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        Ok(self.with(queue, |d| d.dead_letter.clone()))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        Ok(self.with(queue, |d| QueueCounts {
            waiting: d.waiting.len() as u64,
            delayed: d.delayed.len() as u64,
            active: d.active.len() as u64,
            dead_letter: d.dead_letter.len() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobSpec;

    #[tokio::test]
    async fn waiting_is_fifo_within_priority() {
        let store = InMemoryQueueStore::new();
        store.push_waiting("q", "a", 0).await.unwrap();
        store.push_waiting("q", "b", 0).await.unwrap();
        store.push_waiting("q", "c", 0).await.unwrap();
        assert_eq!(store.pop_waiting("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop_waiting("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop_waiting("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.pop_waiting("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lower_priority_value_pops_first() {
        let store = InMemoryQueueStore::new();
        store.push_waiting("q", "later", 5).await.unwrap();
        store.push_waiting("q", "first", 0).await.unwrap();
        assert_eq!(
            store.pop_waiting("q").await.unwrap().as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let store = InMemoryQueueStore::new();
        assert!(store.acquire_lease("q", "j", 60_000).await.unwrap());
        assert!(!store.acquire_lease("q", "j", 60_000).await.unwrap());
        store.release_lease("q", "j").await.unwrap();
        assert!(store.acquire_lease("q", "j", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let store = InMemoryQueueStore::new();
        assert!(store.acquire_lease("q", "j", -1).await.unwrap());
        assert!(!store.lease_alive("q", "j").await.unwrap());
        assert!(store.acquire_lease("q", "j", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn delayed_jobs_become_due() {
        let store = InMemoryQueueStore::new();
        let now = now_ms();
        store.push_delayed("q", "soon", now - 1).await.unwrap();
        store.push_delayed("q", "later", now + 60_000).await.unwrap();
        let due = store.due_delayed("q", now).await.unwrap();
        assert_eq!(due, vec!["soon".to_string()]);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let store = InMemoryQueueStore::new();
        let job = Job::from_spec("scan-queue", JobSpec::new("j1", serde_json::Value::Null));
        store.save_job(&job).await.unwrap();
        assert!(store.load_job("scan-queue", "j1").await.unwrap().is_some());
        assert!(store
            .load_job("analysis-queue", "j1")
            .await
            .unwrap()
            .is_none());
    }
}
