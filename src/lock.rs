//! Distributed Lock
//!
//! Single-owner mutex on the coordination store. A successful acquisition
//! returns a [`Lease`] holding a random token; a background renewer extends
//! the key every `ttl / 3` through compare-and-renew. If a renewal fails the
//! lease is marked lost and the renewer stops; holders must check
//! [`Lease::ensure_held`] before committing writes.
//!
//! `release()` stops and joins the renewer first, then deletes the key with
//! compare-and-delete so a lease that already expired can never remove a
//! successor's key.
//!
//! Lock names:
//! - `sync:orders:{shop_id}`, `sync:income:{shop_id}`, `sync:escrow:{shop_id}:{order_sn}`
//! - `account:{kind}:{principal_id}`
//! - `settlement:{shop_id}:{order_sn}`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coord::CoordinationStore;
use crate::error::{LedgerError, LedgerResult};

const KEY_PREFIX: &str = "lock:";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct LockManager {
    coord: Arc<dyn CoordinationStore>,
}

impl LockManager {
    pub fn new(coord: Arc<dyn CoordinationStore>) -> Self {
        Self { coord }
    }

    /// One round-trip. `Ok(None)` means another holder owns the lock.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> LedgerResult<Option<Lease>> {
        let key = format!("{}{}", KEY_PREFIX, name);
        let token = uuid::Uuid::new_v4().to_string();
        if !self.coord.set_nx(&key, &token, ttl).await? {
            tracing::debug!(lock = name, "Lock contended");
            return Ok(None);
        }
        tracing::debug!(lock = name, "Lease acquired");
        Ok(Some(Lease::start(
            name.to_string(),
            key,
            token,
            ttl,
            self.coord.clone(),
        )))
    }

    /// Poll [`try_acquire`](Self::try_acquire) until `wait` elapses
    pub async fn acquire_with_retry(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> LedgerResult<Lease> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_acquire(name, ttl).await? {
                return Ok(lease);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LedgerError::LockContended(name.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// A held lock. Must be released with [`Lease::release`].
pub struct Lease {
    name: String,
    key: String,
    token: String,
    coord: Arc<dyn CoordinationStore>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    renewer: Option<JoinHandle<()>>,
}

impl Lease {
    fn start(
        name: String,
        key: String,
        token: String,
        ttl: Duration,
        coord: Arc<dyn CoordinationStore>,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let renewer = tokio::spawn(renew_loop(
            name.clone(),
            key.clone(),
            token.clone(),
            ttl,
            coord.clone(),
            lost.clone(),
            stop.clone(),
        ));
        Self {
            name,
            key,
            token,
            coord,
            lost,
            stop,
            renewer: Some(renewer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Fails with `LeaseLost` once mutual exclusion can no longer be assumed
    pub fn ensure_held(&self) -> LedgerResult<()> {
        if self.is_lost() {
            return Err(LedgerError::LeaseLost(self.name.clone()));
        }
        Ok(())
    }

    /// Stop the renewer, wait for it, then delete the key if still ours
    pub async fn release(mut self) -> LedgerResult<()> {
        self.stop.cancel();
        if let Some(handle) = self.renewer.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(lock = %self.name, error = %e, "Lease renewer ended abnormally");
        }
        let deleted = self.coord.compare_and_delete(&self.key, &self.token).await?;
        if deleted {
            tracing::debug!(lock = %self.name, "Lease released");
        } else {
            tracing::warn!(lock = %self.name, "Lease already expired or taken over at release");
        }
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(handle) = self.renewer.take() {
            self.stop.cancel();
            handle.abort();
            tracing::warn!(lock = %self.name, "Lease dropped without release; key expires by ttl");
        }
    }
}

async fn renew_loop(
    name: String,
    key: String,
    token: String,
    ttl: Duration,
    coord: Arc<dyn CoordinationStore>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let interval = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                match coord.compare_and_renew(&key, &token, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        lost.store(true, Ordering::SeqCst);
                        tracing::warn!(lock = %name, "Lease lost: holder token no longer matches");
                        break;
                    }
                    Err(e) => {
                        lost.store(true, Ordering::SeqCst);
                        tracing::warn!(lock = %name, error = %e, "Lease renewal failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;

    fn manager() -> (Arc<MemoryCoordStore>, LockManager) {
        let coord = Arc::new(MemoryCoordStore::new());
        (coord.clone(), LockManager::new(coord))
    }

    #[tokio::test]
    async fn test_second_acquire_is_contended() {
        let (_, locks) = manager();
        let lease = locks
            .try_acquire("settlement:1:A", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first acquire");
        assert!(
            locks
                .try_acquire("settlement:1:A", Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );
        lease.release().await.unwrap();
        assert!(
            locks
                .try_acquire("settlement:1:A", Duration::from_secs(60))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_renewer_keeps_lock_past_ttl() {
        let (coord, locks) = manager();
        let lease = locks
            .try_acquire("account:operator:7", Duration::from_millis(90))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!lease.is_lost());
        assert!(coord.holder("lock:account:operator:7").is_some());
        lease.release().await.unwrap();
        assert!(coord.holder("lock:account:operator:7").is_none());
    }

    #[tokio::test]
    async fn test_takeover_marks_lease_lost() {
        let (coord, locks) = manager();
        let lease = locks
            .try_acquire("sync:orders:5", Duration::from_millis(60))
            .await
            .unwrap()
            .unwrap();
        coord.force_set("lock:sync:orders:5", "intruder", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(lease.is_lost());
        assert!(matches!(lease.ensure_held(), Err(LedgerError::LeaseLost(_))));
        lease.release().await.unwrap();
        // the successor's key survives our release
        assert_eq!(coord.holder("lock:sync:orders:5").as_deref(), Some("intruder"));
    }

    #[tokio::test]
    async fn test_acquire_with_retry_times_out() {
        let (_, locks) = manager();
        let _held = locks
            .try_acquire("account:prepayment:1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let result = locks
            .acquire_with_retry("account:prepayment:1", Duration::from_secs(30), Duration::from_millis(120))
            .await;
        let Err(err) = result else {
            panic!("lock acquired while held");
        };
        assert!(err.is_contention());
    }
}
