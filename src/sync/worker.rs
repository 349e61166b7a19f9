//! Sync Worker
//!
//! Runs every sync kind on its own interval for all enabled shops and drains
//! the on-demand escrow queue fed by the webhook dispatcher.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::coordinator::{SyncCoordinator, SyncOutcome};
use super::state::SyncType;
use super::EscrowRequest;

pub struct SyncWorker {
    coordinator: Arc<SyncCoordinator>,
    escrow_rx: mpsc::Receiver<EscrowRequest>,
}

impl SyncWorker {
    pub fn new(coordinator: Arc<SyncCoordinator>, escrow_rx: mpsc::Receiver<EscrowRequest>) -> Self {
        Self {
            coordinator,
            escrow_rx,
        }
    }

    /// Run until `cancel` fires; joins every schedule before returning
    pub async fn run(self, cancel: CancellationToken) {
        let config = self.coordinator.config().clone();
        let schedules = [
            (SyncType::OrdersFull, config.orders_interval_secs),
            (SyncType::FinanceIncome, config.income_interval_secs),
            (SyncType::EscrowDetail, config.escrow_interval_secs),
        ];
        info!(
            orders_secs = config.orders_interval_secs,
            income_secs = config.income_interval_secs,
            escrow_secs = config.escrow_interval_secs,
            "Starting sync worker"
        );

        let mut handles = Vec::new();
        for (sync_type, secs) in schedules {
            handles.push(tokio::spawn(schedule_loop(
                self.coordinator.clone(),
                sync_type,
                Duration::from_secs(secs.max(1)),
                cancel.clone(),
            )));
        }

        drain_escrow_queue(self.coordinator, self.escrow_rx, cancel.clone()).await;

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync schedule task panicked");
            }
        }
        info!("Sync worker stopped");
    }
}

async fn schedule_loop(
    coordinator: Arc<SyncCoordinator>,
    sync_type: SyncType,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match coordinator.run_all(sync_type, &cancel).await {
                    Ok(completed) => debug!(sync_type = %sync_type, completed, "Sync round finished"),
                    Err(e) => error!(sync_type = %sync_type, error = %e, "Sync round failed"),
                }
            }
        }
    }
}

async fn drain_escrow_queue(
    coordinator: Arc<SyncCoordinator>,
    mut rx: mpsc::Receiver<EscrowRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(r) => r,
                None => break,
            },
        };
        match coordinator
            .sync_escrow_for_order(request.shop_id, &request.order_sn, &cancel)
            .await
        {
            Ok(SyncOutcome::Completed { .. }) => {
                debug!(shop_id = request.shop_id, order_sn = %request.order_sn, "On-demand escrow synced");
            }
            Ok(outcome) => {
                debug!(shop_id = request.shop_id, order_sn = %request.order_sn, ?outcome, "On-demand escrow skipped");
            }
            Err(e) => {
                error!(shop_id = request.shop_id, order_sn = %request.order_sn, error = %e, "On-demand escrow sync failed");
            }
        }
    }
}
