//! Process wiring
//!
//! [`Deps`] carries the three shared handles (storage, coordination store,
//! upstream client). [`LedgerCore::build`] threads them through every
//! component constructor and creates the queues between the background
//! workers; nothing is reached through globals.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::account::{AccountRegistry, TransactionPoster};
use crate::config::AppConfig;
use crate::coord::CoordinationStore;
use crate::directory::PrincipalDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::funding::{RechargeWorkflow, WithdrawWorkflow};
use crate::idgen::IdGenerator;
use crate::lock::LockManager;
use crate::models::ShareRates;
use crate::settlement::{SettlementEngine, SettlementWorker};
use crate::shipment::ShipmentService;
use crate::shop::{CooperationService, ShopService};
use crate::store::Store;
use crate::sync::{SyncCoordinator, SyncWorker};
use crate::upstream::MarketplaceApi;
use crate::webhook::{InboundEvent, WebhookDispatcher, WebhookIngress};

const ESCROW_QUEUE_SIZE: usize = 1024;
const SETTLE_QUEUE_SIZE: usize = 1024;

#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn Store>,
    pub coord: Arc<dyn CoordinationStore>,
    pub api: Arc<dyn MarketplaceApi>,
}

/// Every core service, cheap to clone behind `Arc`
pub struct LedgerCore {
    pub store: Arc<dyn Store>,
    pub api: Arc<dyn MarketplaceApi>,
    pub directory: PrincipalDirectory,
    pub registry: AccountRegistry,
    pub poster: TransactionPoster,
    pub shops: ShopService,
    pub cooperation: CooperationService,
    pub shipments: ShipmentService,
    pub withdraws: WithdrawWorkflow,
    pub recharges: RechargeWorkflow,
    pub sync: Arc<SyncCoordinator>,
    pub settlement: Arc<SettlementEngine>,
}

/// Background tasks, not yet started
pub struct Workers {
    sync: SyncWorker,
    settlement: SettlementWorker,
    dispatcher: WebhookDispatcher,
    webhook_rx: mpsc::Receiver<InboundEvent>,
}

impl LedgerCore {
    pub fn build(deps: Deps, config: &AppConfig) -> LedgerResult<(Arc<LedgerCore>, WebhookIngress, Workers)> {
        let Deps { store, coord, api } = deps;
        let s = &config.settlement;
        let default_rates = ShareRates::new(s.platform_rate, s.operator_rate, s.shop_owner_rate)
            .map_err(LedgerError::InvalidRates)?;

        let locks = LockManager::new(coord.clone());
        let directory = PrincipalDirectory::new(store.clone(), Arc::new(IdGenerator::new(coord.clone())));
        let registry = AccountRegistry::new(store.clone());
        let poster = TransactionPoster::new(store.clone(), registry.clone(), locks.clone());
        let shops = ShopService::new(store.clone(), directory.clone());

        let (settle_tx, settle_rx) = mpsc::channel(SETTLE_QUEUE_SIZE);
        let (escrow_tx, escrow_rx) = mpsc::channel(ESCROW_QUEUE_SIZE);
        let (webhook_tx, webhook_rx) = mpsc::channel(config.webhook.queue_size);

        let sync = Arc::new(
            SyncCoordinator::new(store.clone(), api.clone(), locks.clone(), shops.clone(), config.sync.clone())
                .with_settlement_trigger(settle_tx),
        );
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            registry.clone(),
            locks,
            default_rates,
        ));

        let core = Arc::new(LedgerCore {
            cooperation: CooperationService::new(store.clone(), directory.clone()),
            shipments: ShipmentService::new(store.clone(), directory.clone()),
            withdraws: WithdrawWorkflow::new(store.clone(), poster.clone(), directory.clone()),
            recharges: RechargeWorkflow::new(store.clone(), poster.clone(), directory.clone()),
            store: store.clone(),
            api,
            directory,
            registry,
            poster,
            shops,
            sync: sync.clone(),
            settlement: settlement.clone(),
        });

        let ingress = WebhookIngress::new(webhook_tx, config.upstream.partner_key.clone());
        let workers = Workers {
            sync: SyncWorker::new(sync, escrow_rx),
            settlement: SettlementWorker::new(
                settlement,
                settle_rx,
                Duration::from_secs(s.interval_secs),
                s.batch_size,
            ),
            dispatcher: WebhookDispatcher::new(
                store,
                coord,
                Duration::from_secs(config.webhook.dedupe_window_secs),
            )
            .with_escrow_queue(escrow_tx),
            webhook_rx,
        };
        Ok((core, ingress, workers))
    }
}

impl Workers {
    /// Spawn every worker on the current runtime
    pub fn spawn(self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.sync.run(cancel.clone())),
            tokio::spawn(self.settlement.run(cancel.clone())),
            tokio::spawn(self.dispatcher.run(self.webhook_rx, cancel.clone())),
        ]
    }
}
