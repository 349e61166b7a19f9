//! Settlement: split computation, the engine, and its worker

pub mod engine;
pub mod split;
pub mod worker;

use crate::core_types::{OrderSn, ShopId};

pub use engine::{PendingReport, SettleOutcome, SettlementEngine, settlement_lock_name, settlement_tx_no};
pub use split::{Split, compute_split};
pub use worker::SettlementWorker;

/// Ask the worker to settle one order now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleRequest {
    pub shop_id: ShopId,
    pub order_sn: OrderSn,
}
