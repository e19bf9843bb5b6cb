// Redis-backed queue store. One shared ConnectionManager per process; every
// operation clones the manager (cheap handle) and talks to the same
// multiplexed connection.
//
// Key layout, per queue:
//   ws:{queue}:job:{id}    string   job record JSON
//   ws:{queue}:waiting     zset     score = priority * 2^40 + seq
//   ws:{queue}:seq         string   monotonic enqueue counter
//   ws:{queue}:delayed     zset     score = ready_at epoch ms
//   ws:{queue}:active      set      job ids with a live worker
//   ws:{queue}:lease:{id}  string   SET NX PX lease (at-most-one active)
//   ws:{queue}:dlq         list     dead-letter job JSON

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::job::Job;
use super::store::{QueueCounts, QueueError, QueueStore};

/// Priority shifts the zset score far above any realistic sequence number so
/// equal priorities stay FIFO by enqueue order.
const PRIORITY_SCALE: f64 = (1u64 << 40) as f64;

pub struct RedisQueueStore {
    conn: ConnectionManager,
}

impl RedisQueueStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn job_key(queue: &str, id: &str) -> String {
        format!("ws:{}:job:{}", queue, id)
    }

    fn waiting_key(queue: &str) -> String {
        format!("ws:{}:waiting", queue)
    }

    fn seq_key(queue: &str) -> String {
        format!("ws:{}:seq", queue)
    }

    fn delayed_key(queue: &str) -> String {
        format!("ws:{}:delayed", queue)
    }

    fn active_key(queue: &str) -> String {
        format!("ws:{}:active", queue)
    }

    fn lease_key(queue: &str, id: &str) -> String {
        format!("ws:{}:lease:{}", queue, id)
    }

    fn dlq_key(queue: &str) -> String {
        format!("ws:{}:dlq", queue)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let _: () = conn.set(Self::job_key(&job.queue, &job.id), json).await?;
        Ok(())
    }

    async fn load_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::job_key(queue, id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_job(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::job_key(queue, id)).await?;
        Ok(())
    }

    async fn push_waiting(&self, queue: &str, id: &str, priority: i32) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn.incr(Self::seq_key(queue), 1u64).await?;
        let score = priority as f64 * PRIORITY_SCALE + seq as f64;
        let _: () = conn.zadd(Self::waiting_key(queue), id, score).await?;
        Ok(())
    }

    async fn pop_waiting(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(Self::waiting_key(queue), 1).await?;
        Ok(popped.into_iter().next().map(|(id, _)| id))
    }

    async fn push_delayed(&self, queue: &str, id: &str, ready_at_ms: i64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(Self::delayed_key(queue), id, ready_at_ms as f64)
            .await?;
        Ok(())
    }

    async fn due_delayed(&self, queue: &str, now_ms: i64) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(Self::delayed_key(queue), 0f64, now_ms as f64)
            .await?;
        Ok(due)
    }

    async fn remove_delayed(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(Self::delayed_key(queue), id).await?;
        Ok(())
    }

    async fn acquire_lease(&self, queue: &str, id: &str, ttl_ms: i64) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(Self::lease_key(queue, id))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn renew_lease(&self, queue: &str, id: &str, ttl_ms: i64) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let renewed: bool = conn.pexpire(Self::lease_key(queue, id), ttl_ms).await?;
        Ok(renewed)
    }

    async fn release_lease(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::lease_key(queue, id)).await?;
        Ok(())
    }

    async fn lease_alive(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::lease_key(queue, id)).await?;
        Ok(exists)
    }

    async fn add_active(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(Self::active_key(queue), id).await?;
        Ok(())
    }

    async fn remove_active(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(Self::active_key(queue), id).await?;
        Ok(())
    }

    async fn list_active(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(Self::active_key(queue)).await?;
        Ok(ids)
    }

    async fn push_dead_letter(&self, queue: &str, entry: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(entry)?;
        let _: () = conn.rpush(Self::dlq_key(queue), json).await?;
        Ok(())
    }

    async fn list_dead_letter(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(Self::dlq_key(queue), 0, -1).await?;
        let mut jobs = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping malformed DLQ entry: {}", e),
            }
        }
        Ok(jobs)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.zcard(Self::waiting_key(queue)).await?;
        let delayed: u64 = conn.zcard(Self::delayed_key(queue)).await?;
        let active: u64 = conn.scard(Self::active_key(queue)).await?;
        let dead_letter: u64 = conn.llen(Self::dlq_key(queue)).await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            dead_letter,
        })
    }
}
