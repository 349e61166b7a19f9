//! Principals and their payout destinations

use chrono::Utc;
use std::sync::Arc;

use crate::core_types::{PrincipalId, PrincipalStatus, Role};
use crate::error::{LedgerError, LedgerResult};
use crate::idgen::IdGenerator;
use crate::models::{CollectionAccount, Principal};
use crate::store::Store;

#[derive(Clone)]
pub struct PrincipalDirectory {
    store: Arc<dyn Store>,
    idgen: Arc<IdGenerator>,
}

impl PrincipalDirectory {
    pub fn new(store: Arc<dyn Store>, idgen: Arc<IdGenerator>) -> Self {
        Self { store, idgen }
    }

    /// Allocate an id for `role` and register an active principal
    pub async fn create(&self, role: Role, username: &str) -> LedgerResult<Principal> {
        let username = username.trim();
        if username.is_empty() {
            return Err(LedgerError::Validation("username must not be empty".into()));
        }
        let principal = Principal {
            id: self.idgen.next(role).await?,
            role,
            username: username.to_string(),
            status: PrincipalStatus::Active,
            created_at: Utc::now(),
        };
        self.store.insert_principal(&principal).await?;
        tracing::info!(principal_id = principal.id, role = %role, "Principal created");
        Ok(principal)
    }

    pub async fn get(&self, id: PrincipalId) -> LedgerResult<Principal> {
        self.store
            .get_principal(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("principal", id))
    }

    pub async fn disable(&self, id: PrincipalId) -> LedgerResult<()> {
        if !self.store.set_principal_status(id, PrincipalStatus::Disabled).await? {
            return Err(LedgerError::not_found("principal", id));
        }
        tracing::info!(principal_id = id, "Principal disabled");
        Ok(())
    }

    /// Active principal of the given role, or `Forbidden`
    pub async fn require_active(&self, id: PrincipalId, role: Role) -> LedgerResult<Principal> {
        let principal = self.get(id).await?;
        if principal.role != role {
            return Err(LedgerError::Forbidden(format!(
                "principal {} is {}, expected {}",
                id, principal.role, role
            )));
        }
        if !principal.is_active() {
            return Err(LedgerError::Forbidden(format!("principal {} is disabled", id)));
        }
        Ok(principal)
    }

    pub async fn add_collection_account(
        &self,
        principal_id: PrincipalId,
        channel: &str,
        account_no: &str,
        holder_name: &str,
    ) -> LedgerResult<CollectionAccount> {
        if channel.trim().is_empty() || account_no.trim().is_empty() {
            return Err(LedgerError::Validation(
                "channel and account_no are required".into(),
            ));
        }
        self.get(principal_id).await?;

        let mut account = CollectionAccount {
            id: 0,
            principal_id,
            channel: channel.trim().to_string(),
            account_no: account_no.trim().to_string(),
            holder_name: holder_name.trim().to_string(),
            created_at: Utc::now(),
        };
        account.id = self.store.insert_collection_account(&account).await?;
        Ok(account)
    }

    pub async fn get_collection_account(&self, id: i64) -> LedgerResult<CollectionAccount> {
        self.store
            .get_collection_account(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("collection account", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::store::MemoryStore;

    fn directory() -> PrincipalDirectory {
        let coord = Arc::new(MemoryCoordStore::new());
        PrincipalDirectory::new(Arc::new(MemoryStore::new()), Arc::new(IdGenerator::new(coord)))
    }

    #[tokio::test]
    async fn test_create_and_disable() {
        let dir = directory();
        let op = dir.create(Role::Operator, "ops-1").await.unwrap();
        assert!(op.id > 58_608_109_796);
        assert!(dir.require_active(op.id, Role::Operator).await.is_ok());

        let wrong_role = dir.require_active(op.id, Role::Platform).await.unwrap_err();
        assert!(matches!(wrong_role, LedgerError::Forbidden(_)));

        dir.disable(op.id).await.unwrap();
        let err = dir.require_active(op.id, Role::Operator).await.unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_collection_account_needs_known_principal() {
        let dir = directory();
        let err = dir
            .add_collection_account(42, "bank", "6222", "Holder")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));

        let owner = dir.create(Role::ShopOwner, "owner").await.unwrap();
        let acct = dir
            .add_collection_account(owner.id, "bank", "6222", "Holder")
            .await
            .unwrap();
        assert_eq!(dir.get_collection_account(acct.id).await.unwrap().principal_id, owner.id);
    }
}
