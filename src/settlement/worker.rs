//! Settlement Worker
//!
//! Settles orders pushed by the sync coordinator as their escrow arrives and
//! periodically sweeps shipments still waiting for settlement.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::SettleRequest;
use super::engine::{SettleOutcome, SettlementEngine};

pub struct SettlementWorker {
    engine: Arc<SettlementEngine>,
    rx: mpsc::Receiver<SettleRequest>,
    interval: Duration,
    batch_size: usize,
}

impl SettlementWorker {
    pub fn new(
        engine: Arc<SettlementEngine>,
        rx: mpsc::Receiver<SettleRequest>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            engine,
            rx,
            interval: interval.max(Duration::from_secs(1)),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Starting settlement worker"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.engine.process_pending(self.batch_size).await {
                        Ok(report) if report.scanned > 0 => info!(
                            scanned = report.scanned,
                            completed = report.completed,
                            pending = report.pending,
                            failed = report.failed,
                            "Settlement sweep finished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Settlement sweep failed"),
                    }
                }
                request = self.rx.recv() => {
                    let Some(request) = request else { break };
                    self.settle_one(request).await;
                }
            }
        }
        info!("Settlement worker stopped");
    }

    async fn settle_one(&self, request: SettleRequest) {
        match self.engine.settle(request.shop_id, &request.order_sn).await {
            Ok(SettleOutcome::Completed(_)) => {}
            Ok(outcome) => {
                debug!(shop_id = request.shop_id, order_sn = %request.order_sn, ?outcome, "Settlement deferred");
            }
            Err(e) => {
                error!(shop_id = request.shop_id, order_sn = %request.order_sn, error = %e, "Settlement failed");
            }
        }
    }
}
