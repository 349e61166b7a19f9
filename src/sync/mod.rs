//! Upstream sync: per-shop state machine, coordinator and scheduler

pub mod backoff;
pub mod coordinator;
pub mod state;
pub mod worker;

use crate::core_types::{OrderSn, ShopId};

pub use backoff::RetryPolicy;
pub use coordinator::{SyncCoordinator, SyncOutcome};
pub use state::{SyncRecord, SyncStatus, SyncType};
pub use worker::SyncWorker;

/// Fetch the escrow of one order outside the regular schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowRequest {
    pub shop_id: ShopId,
    pub order_sn: OrderSn,
}
