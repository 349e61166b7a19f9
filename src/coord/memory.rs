use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::CoordinationStore;
use crate::error::{LedgerError, LedgerResult};

/// In-process coordination store.
///
/// `DashMap` entry locks make each operation atomic per key. `set_available`
/// simulates an outage for the ID-generator fallback path.
///
/// Expired keys are dropped every [`PURGE_EVERY`] `set_nx` calls.
#[derive(Default)]
pub struct MemoryCoordStore {
    kv: DashMap<String, (String, Instant)>,
    counters: DashMap<String, i64>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

pub const PURGE_EVERY: u64 = 1024;

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current holder token of a live key
    pub fn holder(&self, key: &str) -> Option<String> {
        self.kv
            .get(key)
            .filter(|v| v.1 > Instant::now())
            .map(|v| v.0.clone())
    }

    /// Overwrite a key regardless of holder (simulates expiry + takeover)
    pub fn force_set(&self, key: &str, token: &str, ttl: Duration) {
        self.kv
            .insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
    }

    /// Number of keys held, live or expired
    pub fn key_count(&self) -> usize {
        self.kv.len()
    }

    /// Drop every expired key; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.kv.len();
        self.kv.retain(|_, v| v.1 > now);
        before.saturating_sub(self.kv.len())
    }

    fn check(&self) -> LedgerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::CoordinationUnavailable(
                "memory coordination store offline".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordStore {
    async fn incr_counter(&self, key: &str, seed: i64, delta: i64) -> LedgerResult<i64> {
        self.check()?;
        let mut value = self.counters.entry(key.to_string()).or_insert(seed);
        *value += delta;
        Ok(*value)
    }

    async fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> LedgerResult<bool> {
        self.check()?;
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            let purged = self.purge_expired();
            tracing::debug!(purged, "Expired coordination keys purged");
        }
        let now = Instant::now();
        match self.kv.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().1 > now {
                    return Ok(false);
                }
                e.insert((token.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Vacant(e) => {
                e.insert((token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_renew(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> LedgerResult<bool> {
        self.check()?;
        let now = Instant::now();
        match self.kv.get_mut(key) {
            Some(mut v) if v.0 == token && v.1 > now => {
                v.1 = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> LedgerResult<bool> {
        self.check()?;
        Ok(self.kv.remove_if(key, |_, v| v.0 == token).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_seeds_then_increments() {
        let store = MemoryCoordStore::new();
        assert_eq!(store.incr_counter("c", 100, 5).await.unwrap(), 105);
        assert_eq!(store.incr_counter("c", 100, 5).await.unwrap(), 110);
    }

    #[tokio::test]
    async fn test_set_nx_respects_holder_and_expiry() {
        let store = MemoryCoordStore::new();
        assert!(store.set_nx("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_nx("k", "b", Duration::from_secs(60)).await.unwrap());

        store.force_set("k", "a", Duration::ZERO);
        assert!(store.set_nx("k", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_ops_require_matching_token() {
        let store = MemoryCoordStore::new();
        store.set_nx("k", "a", Duration::from_secs(60)).await.unwrap();
        assert!(!store.compare_and_renew("k", "b", Duration::from_secs(60)).await.unwrap());
        assert!(store.compare_and_renew("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.compare_and_delete("k", "b").await.unwrap());
        assert!(store.compare_and_delete("k", "a").await.unwrap());
        assert!(store.holder("k").is_none());
    }

    #[tokio::test]
    async fn test_expired_keys_are_purged() {
        let store = MemoryCoordStore::new();
        store.set_nx("live", "a", Duration::from_secs(60)).await.unwrap();
        for i in 0..PURGE_EVERY - 2 {
            store.force_set(&format!("dead:{i}"), "x", Duration::ZERO);
            store.set_nx(&format!("short:{i}"), "x", Duration::ZERO).await.unwrap();
        }
        // the next write crosses the purge interval
        store.set_nx("trigger", "a", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.key_count(), 2);
        assert_eq!(store.holder("live").as_deref(), Some("a"));
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_outage_surfaces_error() {
        let store = MemoryCoordStore::new();
        store.set_available(false);
        let err = store.incr_counter("c", 1, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::CoordinationUnavailable(_)));
    }
}
