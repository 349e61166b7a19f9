//! Shop binding, upstream credentials and operator cooperation

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::SYNC_FAIL_THRESHOLD;
use crate::core_types::{PrincipalId, Role, ShopId};
use crate::directory::PrincipalDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Cooperation, CooperationStatus, ProfitShareConfig, ShareRates, Shop, ShopStatus, TokenPair,
};
use crate::store::Store;
use crate::sync::{SyncRecord, SyncType};

#[derive(Clone)]
pub struct ShopService {
    store: Arc<dyn Store>,
    directory: PrincipalDirectory,
}

impl ShopService {
    pub fn new(store: Arc<dyn Store>, directory: PrincipalDirectory) -> Self {
        Self { store, directory }
    }

    pub async fn get(&self, shop_id: ShopId) -> LedgerResult<Shop> {
        self.store
            .get_shop(shop_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("shop", shop_id))
    }

    /// Bind a shop to its owner and enable every sync kind
    pub async fn bind(
        &self,
        shop_id: ShopId,
        owner_id: PrincipalId,
        tokens: TokenPair,
        region: &str,
    ) -> LedgerResult<Shop> {
        self.directory.require_active(owner_id, Role::ShopOwner).await?;

        if let Some(existing) = self.store.get_shop(shop_id).await?
            && existing.status != ShopStatus::Unbound
            && existing.status != ShopStatus::Deleted
            && existing.owner_id.is_some_and(|o| o != owner_id)
        {
            return Err(LedgerError::ShopAlreadyBound(shop_id));
        }

        let shop = Shop {
            shop_id,
            owner_id: Some(owner_id),
            status: ShopStatus::Bound,
            tokens: Some(tokens),
            region: region.to_string(),
            updated_at: Utc::now(),
        };
        self.store.save_shop(&shop).await?;

        for sync_type in SyncType::ALL {
            let record = match self.store.get_sync_record(shop_id, sync_type).await? {
                Some(mut record) => {
                    record.enable();
                    record
                }
                None => SyncRecord::new(shop_id, sync_type),
            };
            self.store.save_sync_record(&record).await?;
        }

        tracing::info!(shop_id, owner_id, region, "Shop bound");
        Ok(shop)
    }

    /// Drop the binding and disable every sync kind
    pub async fn unbind(&self, shop_id: ShopId) -> LedgerResult<()> {
        let mut shop = self.get(shop_id).await?;
        shop.status = ShopStatus::Unbound;
        shop.owner_id = None;
        shop.tokens = None;
        shop.updated_at = Utc::now();
        self.store.save_shop(&shop).await?;

        for sync_type in SyncType::ALL {
            if let Some(mut record) = self.store.get_sync_record(shop_id, sync_type).await? {
                record.disable();
                self.store.save_sync_record(&record).await?;
            }
        }
        tracing::info!(shop_id, "Shop unbound");
        Ok(())
    }

    /// Refresh token revoked upstream: park the shop and pause its syncs
    pub async fn mark_token_expired(&self, shop_id: ShopId, reason: &str) -> LedgerResult<()> {
        let mut shop = self.get(shop_id).await?;
        shop.status = ShopStatus::TokenExpired;
        shop.updated_at = Utc::now();
        self.store.save_shop(&shop).await?;

        for sync_type in SyncType::ALL {
            if let Some(mut record) = self.store.get_sync_record(shop_id, sync_type).await?
                && record.is_enabled()
            {
                record.pause(reason, SYNC_FAIL_THRESHOLD);
                self.store.save_sync_record(&record).await?;
            }
        }
        tracing::warn!(shop_id, reason, "Shop token expired, syncs paused");
        Ok(())
    }

    pub async fn update_tokens(&self, shop_id: ShopId, tokens: TokenPair) -> LedgerResult<Shop> {
        let mut shop = self.get(shop_id).await?;
        shop.tokens = Some(tokens);
        if shop.status == ShopStatus::TokenExpired {
            shop.status = ShopStatus::Bound;
        }
        shop.updated_at = Utc::now();
        self.store.save_shop(&shop).await?;
        Ok(shop)
    }
}

#[derive(Clone)]
pub struct CooperationService {
    store: Arc<dyn Store>,
    directory: PrincipalDirectory,
}

impl CooperationService {
    pub fn new(store: Arc<dyn Store>, directory: PrincipalDirectory) -> Self {
        Self { store, directory }
    }

    /// One active operator per shop
    pub async fn assign_operator(
        &self,
        shop_id: ShopId,
        operator_id: PrincipalId,
    ) -> LedgerResult<Cooperation> {
        self.directory.require_active(operator_id, Role::Operator).await?;
        let shop = self
            .store
            .get_shop(shop_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("shop", shop_id))?;
        if shop.status != ShopStatus::Bound {
            return Err(LedgerError::Validation(format!("shop {} is not bound", shop_id)));
        }

        let now = Utc::now();
        let mut coop = Cooperation {
            id: 0,
            shop_id,
            operator_id,
            status: CooperationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        coop.id = self.store.insert_cooperation(&coop).await?;
        tracing::info!(shop_id, operator_id, "Operator assigned");
        Ok(coop)
    }

    pub async fn release_operator(&self, shop_id: ShopId) -> LedgerResult<()> {
        if !self.store.release_cooperation(shop_id).await? {
            return Err(LedgerError::not_found("active cooperation", shop_id));
        }
        tracing::info!(shop_id, "Operator released");
        Ok(())
    }

    pub async fn set_profit_share(
        &self,
        shop_id: ShopId,
        operator_id: PrincipalId,
        platform: Decimal,
        operator: Decimal,
        shop_owner: Decimal,
    ) -> LedgerResult<ProfitShareConfig> {
        let rates =
            ShareRates::new(platform, operator, shop_owner).map_err(LedgerError::InvalidRates)?;
        let config = ProfitShareConfig {
            shop_id,
            operator_id,
            rates,
            updated_at: Utc::now(),
        };
        self.store.save_profit_share(&config).await?;
        tracing::info!(
            shop_id,
            operator_id,
            platform = %rates.platform,
            operator = %rates.operator,
            shop_owner = %rates.shop_owner,
            "Profit share updated"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::idgen::IdGenerator;
    use crate::store::{MemoryStore, SyncStore};
    use crate::sync::SyncStatus;
    use std::str::FromStr;

    struct Fixture {
        store: Arc<MemoryStore>,
        directory: PrincipalDirectory,
        shops: ShopService,
        coops: CooperationService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let idgen = Arc::new(IdGenerator::new(Arc::new(MemoryCoordStore::new())));
        let directory = PrincipalDirectory::new(store.clone(), idgen);
        Fixture {
            shops: ShopService::new(store.clone(), directory.clone()),
            coops: CooperationService::new(store.clone(), directory.clone()),
            store,
            directory,
        }
    }

    fn tokens() -> TokenPair {
        TokenPair {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expire_at: Utc::now() + chrono::Duration::hours(4),
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_and_sync_records() {
        let f = fixture();
        let a = f.directory.create(Role::ShopOwner, "a").await.unwrap();
        let b = f.directory.create(Role::ShopOwner, "b").await.unwrap();

        f.shops.bind(9, a.id, tokens(), "SG").await.unwrap();
        for t in SyncType::ALL {
            let r = f.store.get_sync_record(9, t).await.unwrap().unwrap();
            assert_eq!(r.status, SyncStatus::Enabled);
        }
        let err = f.shops.bind(9, b.id, tokens(), "SG").await.unwrap_err();
        assert!(matches!(err, LedgerError::ShopAlreadyBound(9)));

        f.shops.unbind(9).await.unwrap();
        let r = f.store.get_sync_record(9, SyncType::OrdersFull).await.unwrap().unwrap();
        assert_eq!(r.status, SyncStatus::Disabled);
        f.shops.bind(9, b.id, tokens(), "SG").await.unwrap();
    }

    #[tokio::test]
    async fn test_token_expiry_pauses_with_threshold_count() {
        let f = fixture();
        let a = f.directory.create(Role::ShopOwner, "a").await.unwrap();
        f.shops.bind(3, a.id, tokens(), "MY").await.unwrap();
        f.shops.mark_token_expired(3, "invalid_refresh_token").await.unwrap();

        assert_eq!(f.shops.get(3).await.unwrap().status, ShopStatus::TokenExpired);
        for t in SyncType::ALL {
            let r = f.store.get_sync_record(3, t).await.unwrap().unwrap();
            assert_eq!(r.status, SyncStatus::Paused);
            assert!(r.consecutive_fail_count >= SYNC_FAIL_THRESHOLD);
        }
    }

    #[tokio::test]
    async fn test_single_active_operator_and_rates() {
        let f = fixture();
        let owner = f.directory.create(Role::ShopOwner, "o").await.unwrap();
        let op1 = f.directory.create(Role::Operator, "op1").await.unwrap();
        let op2 = f.directory.create(Role::Operator, "op2").await.unwrap();
        f.shops.bind(1, owner.id, tokens(), "SG").await.unwrap();

        f.coops.assign_operator(1, op1.id).await.unwrap();
        assert!(matches!(
            f.coops.assign_operator(1, op2.id).await.unwrap_err(),
            LedgerError::Conflict(_)
        ));
        f.coops.release_operator(1).await.unwrap();
        f.coops.assign_operator(1, op2.id).await.unwrap();

        let d = |s: &str| Decimal::from_str(s).unwrap();
        let err = f
            .coops
            .set_profit_share(1, op2.id, d("5"), d("45"), d("49.99"))
            .await
            .unwrap_err();
        assert_eq!(err.business_code(), 1002);
        assert!(f.coops.set_profit_share(1, op2.id, d("10"), d("40"), d("50")).await.is_ok());
    }
}
