//! Coordination store
//!
//! Shared key/value primitives behind the distributed lock, the ID counters
//! and the webhook dedupe markers. Every operation is a single atomic step on
//! the backing store; nothing here holds state between calls.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::LedgerResult;

pub use memory::MemoryCoordStore;
pub use postgres::PgCoordStore;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically add `delta` to the counter at `key`, initialising it to
    /// `seed` on first use. Returns the value after the increment.
    async fn incr_counter(&self, key: &str, seed: i64, delta: i64) -> LedgerResult<i64>;

    /// Set `key` to `token` if absent or expired. True if this call set it.
    async fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> LedgerResult<bool>;

    /// Extend the expiry only while `key` still holds `token`.
    async fn compare_and_renew(&self, key: &str, token: &str, ttl: Duration)
    -> LedgerResult<bool>;

    /// Delete `key` only while it still holds `token`.
    async fn compare_and_delete(&self, key: &str, token: &str) -> LedgerResult<bool>;
}
