// =============================================================================
// Cache tier — L1 read-through with singleflight, optional distributed L2
// =============================================================================
//
// Reads check L1, then L2 (Redis), then run the fetcher. Concurrent misses on
// the same key coalesce process-locally: one leader fetches while followers
// wait and re-check. Cache writes happen only after the authoritative fetch
// returns, and invalidation is by structured key prefix.
//
// Every L2 failure degrades to direct store reads — the tier counts the error
// and keeps serving. An unreachable Redis at startup simply disables L2.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::app_state::HealthCounters;
use crate::cache::keys::flush_invalidation_prefixes;
use crate::cache::l1::L1Cache;
use crate::errors::{CacheError, QueryError};
use crate::types::Timeframe;

/// How long a follower waits for the leader before fetching on its own.
const SINGLEFLIGHT_WAIT: Duration = Duration::from_secs(2);

pub struct CacheTier {
    l1: L1Cache,
    l2: Option<ConnectionManager>,
    counters: Arc<HealthCounters>,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl CacheTier {
    /// Connect the tier. A missing or unreachable Redis URL leaves L2 off;
    /// the tier still serves from L1.
    pub async fn connect(
        redis_url: Option<&str>,
        max_entries: usize,
        max_bytes: usize,
        counters: Arc<HealthCounters>,
    ) -> Self {
        let l2 = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(cm) => {
                        info!("L2 cache connected");
                        Some(cm)
                    }
                    Err(e) => {
                        warn!(error = %e, "L2 cache unreachable — running L1-only");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "invalid redis URL — running L1-only");
                    None
                }
            },
            None => None,
        };

        Self {
            l1: L1Cache::new(max_entries, max_bytes),
            l2,
            counters,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// L1-only tier for tests and cache-less deployments.
    pub fn disabled() -> Self {
        Self {
            l1: L1Cache::new(1_000, 1 << 20),
            l2: None,
            counters: Arc::new(HealthCounters::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Read-through fetch. Returns the value and whether it was a cache hit.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<(T, bool), QueryError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut fetcher = Some(fetcher);
        loop {
            if let Some(cached) = self.lookup(key).await {
                match serde_json::from_str::<T>(&cached) {
                    Ok(v) => {
                        self.counters.cache_hits_total.fetch_add(1, Ordering::Relaxed);
                        return Ok((v, true));
                    }
                    Err(e) => {
                        // A poisoned entry is dropped and refetched.
                        debug!(key, error = %e, "cache entry failed to decode — evicting");
                        self.l1.remove_prefix(key);
                    }
                }
            }

            // Become the singleflight leader, or wait for the current one.
            let notify = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        inflight.insert(key.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match notify {
                Some(notify) => {
                    // Follower: wait, then loop to re-check the cache. If the
                    // leader failed or timed out we take over with our own
                    // fetcher on the next pass.
                    let _ = tokio::time::timeout(SINGLEFLIGHT_WAIT, notify.notified()).await;
                    if fetcher.is_none() {
                        // Defensive: this caller already fetched once.
                        return Err(QueryError::ServiceUnavailable { retry_after_ms: 500 });
                    }
                    continue;
                }
                None => {
                    let result = match fetcher.take() {
                        Some(f) => f().await,
                        None => Err(QueryError::ServiceUnavailable { retry_after_ms: 500 }),
                    };

                    // Release followers whatever happened.
                    let released = self.inflight.lock().remove(key);
                    if let Some(n) = released {
                        n.notify_waiters();
                    }

                    let value = result?;
                    self.counters.cache_misses_total.fetch_add(1, Ordering::Relaxed);
                    if let Ok(serialized) = serde_json::to_string(&value) {
                        self.store(key, serialized, ttl).await;
                    }
                    return Ok((value, false));
                }
            }
        }
    }

    /// Populate many keys at once (post-backfill warmup).
    pub async fn set_many(&self, entries: &[(String, String, Duration)]) {
        for (key, value, ttl) in entries {
            self.store(key, value.clone(), *ttl).await;
        }
    }

    /// Batch lookup, L1 first, L2 for the remainder.
    pub async fn get_many(&self, keys: &[String]) -> Vec<Option<String>> {
        let mut out: Vec<Option<String>> = keys.iter().map(|k| self.l1.get(k)).collect();

        let missing: Vec<usize> = (0..keys.len()).filter(|i| out[*i].is_none()).collect();
        if missing.is_empty() {
            return out;
        }
        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            let miss_keys: Vec<&String> = missing.iter().map(|i| &keys[*i]).collect();
            match conn.mget::<_, Vec<Option<String>>>(&miss_keys).await {
                Ok(values) => {
                    for (slot, value) in missing.into_iter().zip(values) {
                        out[slot] = value;
                    }
                }
                Err(e) => self.degrade(CacheError::Unavailable(e.to_string()), "L2 mget failed"),
            }
        }
        out
    }

    /// Clear every cached read that a flush for this key tuple could have
    /// made stale. Best-effort on L2; staleness is bounded by TTL anyway.
    pub async fn invalidate_on_flush(&self, symbol: &str, tf: Timeframe, expiry: NaiveDate) {
        for prefix in flush_invalidation_prefixes(symbol, tf, expiry) {
            self.invalidate_pattern(&prefix).await;
        }
    }

    /// Remove every entry whose key starts with `prefix` from both layers.
    pub async fn invalidate_pattern(&self, prefix: &str) {
        self.l1.remove_prefix(prefix);

        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            let pattern = format!("{prefix}*");
            let keys: Result<Vec<String>, _> = async {
                let mut iter = conn.scan_match::<_, String>(&pattern).await?;
                let mut keys = Vec::new();
                while let Some(k) = iter.next_item().await {
                    keys.push(k);
                }
                Ok::<_, redis::RedisError>(keys)
            }
            .await;

            match keys {
                Ok(keys) if !keys.is_empty() => {
                    let mut conn = l2.clone();
                    if let Err(e) = conn.del::<_, ()>(&keys).await {
                        self.degrade(CacheError::Unavailable(e.to_string()), "L2 delete failed");
                    }
                }
                Ok(_) => {}
                Err(e) => self.degrade(CacheError::Unavailable(e.to_string()), "L2 scan failed"),
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<String> {
        if let Some(v) = self.l1.get(key) {
            return Some(v);
        }
        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(Some(v)) => return Some(v),
                Ok(None) => {}
                Err(e) => self.degrade(CacheError::Unavailable(e.to_string()), "L2 get failed"),
            }
        }
        None
    }

    async fn store(&self, key: &str, value: String, ttl: Duration) {
        self.l1.insert(key.to_string(), value.clone(), ttl);
        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            let ttl_secs = ttl.as_secs().max(1);
            if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
                self.degrade(CacheError::Unavailable(e.to_string()), "L2 set failed");
            }
        }
    }

    /// Count a cache failure and carry on; the tier never propagates it.
    fn degrade(&self, err: CacheError, context: &str) {
        self.counters.cache_errors_total.fetch_add(1, Ordering::Relaxed);
        debug!(error = %err, "{context} — degrading");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn miss_fetches_then_hit_serves_cached() {
        let tier = CacheTier::disabled();
        let calls = AtomicU32::new(0);

        let (v, hit) = tier
            .get_or_fetch("k", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, QueryError>(41)
            })
            .await
            .unwrap();
        assert_eq!((v, hit), (41, false));

        let (v, hit) = tier
            .get_or_fetch("k", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, QueryError>(99)
            })
            .await
            .unwrap();
        assert_eq!((v, hit), (41, true), "second read must come from cache");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let tier = Arc::new(CacheTier::disabled());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tier = tier.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                tier.get_or_fetch("shared", Duration::from_secs(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, QueryError>("value".to_string())
                })
                .await
                .unwrap()
                .0
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fetches must coalesce");
    }

    #[tokio::test]
    async fn fetch_error_propagates_and_releases_followers() {
        let tier = CacheTier::disabled();
        let err = tier
            .get_or_fetch::<i64, _, _>("bad", Duration::from_secs(5), || async {
                Err(QueryError::ServiceUnavailable { retry_after_ms: 100 })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ServiceUnavailable { .. }));

        // The key is not poisoned: a later fetch succeeds.
        let (v, hit) = tier
            .get_or_fetch("bad", Duration::from_secs(5), || async {
                Ok::<_, QueryError>(7)
            })
            .await
            .unwrap();
        assert_eq!((v, hit), (7, false));
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let tier = CacheTier::disabled();
        let expiry = NaiveDate::from_ymd_opt(2025, 11, 6).unwrap();
        let key = crate::cache::keys::latest_key(
            "NIFTY",
            Timeframe::Min5,
            crate::types::Indicator::Iv,
            &[expiry],
        );

        let (v, _) = tier
            .get_or_fetch(&key, Duration::from_secs(60), || async {
                Ok::<_, QueryError>(1)
            })
            .await
            .unwrap();
        assert_eq!(v, 1);

        tier.invalidate_on_flush("NIFTY", Timeframe::Min5, expiry).await;

        let (v, hit) = tier
            .get_or_fetch(&key, Duration::from_secs(60), || async {
                Ok::<_, QueryError>(2)
            })
            .await
            .unwrap();
        assert_eq!((v, hit), (2, false), "post-flush read must refetch");
    }

    #[tokio::test]
    async fn ttl_expiry_refetches() {
        let tier = CacheTier::disabled();
        let (v, _) = tier
            .get_or_fetch("t", Duration::from_millis(1), || async {
                Ok::<_, QueryError>(1)
            })
            .await
            .unwrap();
        assert_eq!(v, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (v, hit) = tier
            .get_or_fetch("t", Duration::from_secs(60), || async {
                Ok::<_, QueryError>(2)
            })
            .await
            .unwrap();
        assert_eq!((v, hit), (2, false));
    }

    #[tokio::test]
    async fn get_many_reads_through_l1() {
        let tier = CacheTier::disabled();
        tier.set_many(&[("a".into(), "1".into(), Duration::from_secs(60))])
            .await;
        let got = tier.get_many(&["a".into(), "b".into()]).await;
        assert_eq!(got, vec![Some("1".into()), None]);
    }
}
