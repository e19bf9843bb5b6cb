// In-memory response caching and single-flight request collapsing.
//
// Two owners live here, both process-local and mutex-guarded:
// `ResponseCache` is a value cache with per-entry TTLs (capped at 1000
// entries, lazy expiry), and `SingleFlight` collapses concurrent identical
// computations onto one execution whose result lingers briefly after
// completion. The API's in-flight request dedup is a `SingleFlight` over
// buffered HTTP responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 1000;

type KeyLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

fn key_lock(locks: &KeyLocks, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = locks.lock().expect("locks mutex");
    Arc::clone(
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
    )
}

/// Drop the per-key lock entry once no other caller holds it (the map entry
/// plus our local Arc account for two references).
fn release_key_lock(locks: &KeyLocks, key: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
    let mut locks = locks.lock().expect("locks mutex");
    if Arc::strong_count(lock) <= 2 {
        locks.remove(key);
    }
}

// ============================================
// Response cache
// ============================================

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    locks: KeyLocks,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().expect("cache mutex");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache mutex");
        let now = Instant::now();

        if entries.len() >= MAX_ENTRIES {
            entries.retain(|_, e| e.expires_at > now);
        }
        if entries.len() >= MAX_ENTRIES {
            // Still full after expiry sweep: drop the entry closest to
            // expiring.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Cache-or-compute with single-flight semantics per key. The computed
    /// value lingers for `ttl`, so identical requests arriving within that
    /// window are served without recomputing.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let lock = key_lock(&self.locks, key);
        let _guard = lock.lock().await;

        // A concurrent caller may have finished while we waited.
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let value = compute().await?;
        self.put(key, value.clone(), ttl);

        drop(_guard);
        release_key_lock(&self.locks, key, &lock);

        Ok(value)
    }
}

// ============================================
// Single-flight
// ============================================

/// Collapses concurrent computations for the same key onto one execution:
/// the first caller computes, everyone waiting on the key receives the same
/// result, and the result keeps serving identical keys for `linger` after
/// completion.
pub struct SingleFlight<T> {
    linger: Duration,
    entries: Mutex<HashMap<String, (T, Instant)>>,
    locks: KeyLocks,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new(linger: Duration) -> Self {
        Self {
            linger,
            entries: Mutex::new(HashMap::new()),
            locks: KeyLocks::default(),
        }
    }

    fn fresh(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().expect("entries mutex");
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, value: T) {
        let mut entries = self.entries.lock().expect("entries mutex");
        let now = Instant::now();
        if entries.len() >= MAX_ENTRIES {
            entries.retain(|_, (_, expires_at)| *expires_at > now);
        }
        entries.insert(key.to_string(), (value, now + self.linger));
    }

    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if let Some(hit) = self.fresh(key) {
            return hit;
        }

        let lock = key_lock(&self.locks, key);
        let guard = lock.lock().await;

        if let Some(hit) = self.fresh(key) {
            return hit;
        }

        let value = compute().await;
        self.store(key, value.clone());

        drop(guard);
        release_key_lock(&self.locks, key, &lock);

        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn get_put_with_expiry() {
        let cache = ResponseCache::new();
        cache.put("k", json!(1), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(json!(1)));

        cache.put("gone", json!(2), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("gone"), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ResponseCache::new();
        for i in 0..(MAX_ENTRIES + 50) {
            cache.put(&format!("k{i}"), json!(i), Duration::from_secs(60));
        }
        let entries = cache.entries.lock().unwrap();
        assert!(entries.len() <= MAX_ENTRIES);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_compute_once() {
        let cache = Arc::new(ResponseCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("dedup", Duration::from_secs(1), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, std::convert::Infallible>(json!("result"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!("result"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = ResponseCache::new();
        let result: Result<_, &str> = cache
            .get_or_compute("err", Duration::from_secs(1), || async { Err("boom") })
            .await;
        assert!(result.is_err());

        let ok: Result<_, &str> = cache
            .get_or_compute("err", Duration::from_secs(1), || async { Ok(json!(2)) })
            .await;
        assert_eq!(ok.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn single_flight_collapses_concurrent_runs() {
        let flight: Arc<SingleFlight<String>> =
            Arc::new(SingleFlight::new(Duration::from_secs(1)));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flight
                    .run("GET:/api/scans/x/status:10.0.0.1", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        "response".to_string()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "response");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_flight_result_lingers_then_expires() {
        let flight: SingleFlight<u32> = SingleFlight::new(Duration::from_millis(40));
        let calls = AtomicU32::new(0);

        let first = flight
            .run("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                1u32
            })
            .await;
        assert_eq!(first, 1);

        // Within the linger window the first result is still served.
        let second = flight
            .run("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                2u32
            })
            .await;
        assert_eq!(second, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let third = flight
            .run("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                3u32
            })
            .await;
        assert_eq!(third, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_flight_keys_are_independent() {
        let flight: SingleFlight<u32> = SingleFlight::new(Duration::from_secs(1));
        assert_eq!(flight.run("a", || async { 1 }).await, 1);
        assert_eq!(flight.run("b", || async { 2 }).await, 2);
    }
}
