//! Per-(shop, sync kind) state machine
//!
//! ```text
//! enabled --success--> enabled  (consecutive_fail_count = 0)
//! enabled --error-->   enabled  (count += 1)            while count < 10
//! enabled --error-->   paused   (count = 10, last_error)
//! paused  --reset-->   enabled  (count = 0)
//! any     --delete-->  disabled (shop unbound)
//! ```
//!
//! Invariant: `status == Paused` implies `consecutive_fail_count >= 10`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::ShopId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    OrdersFull,
    FinanceIncome,
    EscrowDetail,
}

impl SyncType {
    pub const ALL: [SyncType; 3] = [
        SyncType::OrdersFull,
        SyncType::FinanceIncome,
        SyncType::EscrowDetail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::OrdersFull => "orders_full",
            SyncType::FinanceIncome => "finance_income",
            SyncType::EscrowDetail => "escrow_detail",
        }
    }

    /// Lock name guarding a whole pass of this kind
    pub fn lock_name(&self, shop_id: ShopId) -> String {
        match self {
            SyncType::OrdersFull => format!("sync:orders:{}", shop_id),
            SyncType::FinanceIncome => format!("sync:income:{}", shop_id),
            SyncType::EscrowDetail => format!("sync:escrow:{}", shop_id),
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid sync type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Disabled = 0,
    Enabled = 1,
    Paused = 2,
}

impl From<i16> for SyncStatus {
    fn from(v: i16) -> Self {
        match v {
            1 => SyncStatus::Enabled,
            2 => SyncStatus::Paused,
            _ => SyncStatus::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub shop_id: ShopId,
    pub sync_type: SyncType,
    /// Upstream timestamp (seconds) the next pass starts from
    pub cursor_ts: i64,
    /// Page marker inside the current window; cleared when a pass finishes
    pub page_marker: Option<String>,
    /// Upper bound of the window `page_marker` belongs to
    pub window_end: Option<i64>,
    pub status: SyncStatus,
    pub consecutive_fail_count: i32,
    pub total_synced_count: i64,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(shop_id: ShopId, sync_type: SyncType) -> Self {
        Self {
            shop_id,
            sync_type,
            cursor_ts: 0,
            page_marker: None,
            window_end: None,
            status: SyncStatus::Enabled,
            consecutive_fail_count: 0,
            total_synced_count: 0,
            last_error: None,
            last_synced_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == SyncStatus::Enabled
    }

    /// Time window `[from, to]` for the next pass. A stored page marker is
    /// only resumed together with the window it was issued for; without one
    /// the marker is dropped and a fresh window ending at `now_ts` opens.
    pub fn open_window(&mut self, now_ts: i64, initial_lookback: i64) -> (i64, i64) {
        let from = if self.cursor_ts > 0 {
            self.cursor_ts
        } else {
            now_ts - initial_lookback
        };
        if self.page_marker.is_some()
            && let Some(end) = self.window_end
        {
            return (from, end);
        }
        self.page_marker = None;
        self.window_end = Some(now_ts);
        (from, now_ts)
    }

    /// Window fully consumed: the next pass starts at its end
    pub fn close_window(&mut self) {
        if let Some(end) = self.window_end.take() {
            self.cursor_ts = end;
        }
        self.page_marker = None;
    }

    pub fn record_success(&mut self, synced: i64) {
        self.consecutive_fail_count = 0;
        self.total_synced_count += synced;
        self.last_error = None;
        let now = Utc::now();
        self.last_synced_at = Some(now);
        self.updated_at = now;
    }

    /// Returns true when this failure paused the record
    pub fn record_failure(&mut self, error: &str, threshold: i32) -> bool {
        self.consecutive_fail_count += 1;
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
        if self.consecutive_fail_count >= threshold {
            self.consecutive_fail_count = threshold;
            self.status = SyncStatus::Paused;
            return true;
        }
        false
    }

    /// Immediate pause for terminal upstream errors
    pub fn pause(&mut self, error: &str, threshold: i32) {
        self.consecutive_fail_count = self.consecutive_fail_count.max(threshold);
        self.last_error = Some(error.to_string());
        self.status = SyncStatus::Paused;
        self.updated_at = Utc::now();
    }

    /// Operator reset; only a paused record can be re-enabled
    pub fn reset(&mut self) -> bool {
        if self.status != SyncStatus::Paused {
            return false;
        }
        self.status = SyncStatus::Enabled;
        self.consecutive_fail_count = 0;
        self.last_error = None;
        self.updated_at = Utc::now();
        true
    }

    pub fn disable(&mut self) {
        self.status = SyncStatus::Disabled;
        self.page_marker = None;
        self.window_end = None;
        self.updated_at = Utc::now();
    }

    /// Re-enable after a fresh binding
    pub fn enable(&mut self) {
        self.status = SyncStatus::Enabled;
        self.consecutive_fail_count = 0;
        self.last_error = None;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pauses_exactly_at_threshold() {
        let mut r = SyncRecord::new(1, SyncType::OrdersFull);
        for i in 1..10 {
            assert!(!r.record_failure("boom", 10));
            assert_eq!(r.consecutive_fail_count, i);
            assert!(r.is_enabled());
        }
        assert!(r.record_failure("boom", 10));
        assert_eq!(r.status, SyncStatus::Paused);
        assert_eq!(r.consecutive_fail_count, 10);
        assert_eq!(r.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_resumed_marker_keeps_its_window() {
        let mut r = SyncRecord::new(1, SyncType::OrdersFull);
        assert_eq!(r.open_window(1_000, 100), (900, 1_000));

        r.page_marker = Some("p2".into());
        // a later resume reuses the original upper bound
        assert_eq!(r.open_window(5_000, 100), (900, 1_000));
        assert_eq!(r.page_marker.as_deref(), Some("p2"));

        r.close_window();
        assert_eq!(r.cursor_ts, 1_000);
        assert!(r.page_marker.is_none() && r.window_end.is_none());
        assert_eq!(r.open_window(5_000, 100), (1_000, 5_000));
    }

    #[test]
    fn test_marker_without_window_is_dropped() {
        let mut r = SyncRecord::new(1, SyncType::OrdersFull);
        r.cursor_ts = 700;
        r.page_marker = Some("stale".into());
        assert_eq!(r.open_window(2_000, 100), (700, 2_000));
        assert!(r.page_marker.is_none());
        assert_eq!(r.window_end, Some(2_000));
    }

    #[test]
    fn test_success_clears_fail_count() {
        let mut r = SyncRecord::new(1, SyncType::FinanceIncome);
        r.record_failure("x", 10);
        r.record_success(42);
        assert_eq!(r.consecutive_fail_count, 0);
        assert_eq!(r.total_synced_count, 42);
        assert!(r.last_synced_at.is_some());
    }

    #[test]
    fn test_reset_only_from_paused() {
        let mut r = SyncRecord::new(1, SyncType::EscrowDetail);
        assert!(!r.reset());
        r.pause("token expired", 10);
        assert!(r.consecutive_fail_count >= 10);
        assert!(r.reset());
        assert_eq!(r.consecutive_fail_count, 0);
        assert!(r.is_enabled());

        r.disable();
        assert!(!r.reset());
    }

    #[test]
    fn test_lock_names() {
        assert_eq!(SyncType::OrdersFull.lock_name(9), "sync:orders:9");
        assert_eq!(SyncType::FinanceIncome.lock_name(9), "sync:income:9");
    }
}
