use std::sync::Arc;

use super::models::{Account, AccountKind, JournalEntry, JournalFilter};
use crate::core_types::{PLATFORM_PRINCIPAL_ID, PrincipalId};
use crate::error::{LedgerError, LedgerResult};
use crate::shard::{self, SHARD_COUNT, merge_desc, per_shard_fetch};
use crate::store::Store;

/// Lazily created balance rows and journal reads. Reads take no locks;
/// every mutation goes through the poster.
#[derive(Clone)]
pub struct AccountRegistry {
    store: Arc<dyn Store>,
}

impl AccountRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get_or_create(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<Account> {
        if (kind == AccountKind::PlatformCommission) != (principal_id == PLATFORM_PRINCIPAL_ID) {
            return Err(LedgerError::Validation(format!(
                "account kind {} is not valid for principal {}",
                kind, principal_id
            )));
        }
        if let Some(account) = self.store.get_account(kind, principal_id).await? {
            return Ok(account);
        }
        // Concurrent creators collapse on the primary key
        self.store.create_account_if_absent(kind, principal_id).await?;
        self.store
            .get_account(kind, principal_id)
            .await?
            .ok_or_else(|| LedgerError::Internal(format!("account {}:{} vanished", kind, principal_id)))
    }

    /// Existing rows of one principal
    pub async fn balances(&self, principal_id: PrincipalId) -> LedgerResult<Vec<Account>> {
        self.store.list_accounts(principal_id).await
    }

    /// Journal of one principal, newest first. Single-shard read.
    pub async fn list_transactions(
        &self,
        kind: Option<AccountKind>,
        principal_id: PrincipalId,
        offset: usize,
        limit: usize,
    ) -> LedgerResult<Vec<JournalEntry>> {
        let filter = JournalFilter {
            kind,
            principal_id: Some(principal_id),
            tx_type: None,
        };
        self.store
            .list_journal_shard(shard::index(principal_id), &filter, offset, limit)
            .await
    }

    /// Cross-shard journal page ordered by `created_at` desc, then `tx_no`
    /// desc. Each shard contributes at most `offset + limit` rows (capped), so
    /// pages beyond the cap are approximate.
    pub async fn list_transactions_all(
        &self,
        filter: &JournalFilter,
        offset: usize,
        limit: usize,
    ) -> LedgerResult<Vec<JournalEntry>> {
        if let Some(principal_id) = filter.principal_id {
            return self
                .store
                .list_journal_shard(shard::index(principal_id), filter, offset, limit)
                .await;
        }

        let fetch = per_shard_fetch(offset, limit);
        let reads = (0..SHARD_COUNT).map(|idx| self.store.list_journal_shard(idx, filter, 0, fetch));
        let shards = futures::future::try_join_all(reads).await?;

        Ok(merge_desc(
            shards,
            |e: &JournalEntry| (e.created_at, e.tx_no.clone()),
            offset,
            limit,
        ))
    }
}
