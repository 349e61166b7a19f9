//! Transaction Poster
//!
//! The only writer of account balances. Each posting runs under the
//! `account:{kind}:{principal_id}` lease, re-reads the row, checks the
//! type-specific precondition and hands a fully computed [`Posting`] to the
//! store, which writes the journal entry and the balance in one transaction.
//!
//! | type       | sign | requires                         | on failure           |
//! |------------|------|----------------------------------|----------------------|
//! | recharge   | +    |                                  |                      |
//! | withdraw   | -    | frozen >= amount, balance >= it  | INSUFFICIENT_BALANCE |
//! | settle_in  | +    | (platform commission may be -)   |                      |
//! | settle_out | -    | available >= amount              | INSUFFICIENT_BALANCE |
//! | penalty    | -    | available >= amount              | INSUFFICIENT_BALANCE |
//! | subsidy    | +    |                                  |                      |
//! | commission | +/-  | available >= amount when -       | INSUFFICIENT_BALANCE |
//! | freeze     | 0    | available >= delta               | INSUFFICIENT_BALANCE |
//! | unfreeze   | 0    | frozen >= delta                  | INVALID_UNFREEZE     |
//!
//! `available` is `balance - frozen`. A withdraw discharges the reservation
//! made by its freeze, so a paid withdrawal leaves exactly two entries.
//!
//! [`TransactionPoster::post_with`] commits the entry together with a funding
//! application change, so an audit never moves a status without its balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::models::{Account, AccountKind, AuditStatus, JournalEntry, Posting, TxType};
use super::registry::AccountRegistry;
use crate::core_types::PrincipalId;
use crate::error::{LedgerError, LedgerResult};
use crate::lock::{Lease, LockManager};
use crate::money::round_money;
use crate::store::{FundsChange, Store};

pub const ACCOUNT_LOCK_TTL: Duration = Duration::from_secs(30);
/// How long a poster polls for a contended account lock
pub const ACCOUNT_LOCK_WAIT: Duration = Duration::from_secs(5);
const MAX_TX_NO_ATTEMPTS: usize = 5;

pub fn account_lock_name(kind: AccountKind, principal_id: PrincipalId) -> String {
    format!("account:{}:{}", kind, principal_id)
}

/// `{prefix}{YYYYMMDDHHMMSS}{unix_ns mod 10000}`
pub fn generate_tx_no(tx_type: TxType, now: DateTime<Utc>) -> String {
    let suffix = now.timestamp_nanos_opt().unwrap_or_default().rem_euclid(10_000);
    format!("{}{}{:04}", tx_type.prefix(), now.format("%Y%m%d%H%M%S"), suffix)
}

/// Compute the posting for `amount` against `account`, enforcing the
/// precondition table. For freeze/unfreeze `amount` is the positive delta.
pub fn plan_posting(
    account: &Account,
    tx_type: TxType,
    amount: Decimal,
    tx_no: String,
    remark: &str,
    audit_status: AuditStatus,
    now: DateTime<Utc>,
) -> LedgerResult<Posting> {
    let amount = round_money(amount);
    let available = account.available();
    let invalid = |reason: &str| {
        Err(LedgerError::InvalidAmount(format!(
            "{} {} for {}: {}",
            tx_type, amount, account.kind, reason
        )))
    };

    let (delta, frozen_delta) = match tx_type {
        TxType::Recharge | TxType::Subsidy => {
            if amount <= Decimal::ZERO {
                return invalid("must be positive");
            }
            (amount, Decimal::ZERO)
        }
        TxType::SettleIn => {
            // Platform commission absorbs settlement losses
            let loss_allowed = account.kind == AccountKind::PlatformCommission;
            if amount <= Decimal::ZERO && !(loss_allowed && amount < Decimal::ZERO) {
                return invalid("must be positive");
            }
            (amount, Decimal::ZERO)
        }
        TxType::SettleOut | TxType::Penalty => {
            if amount >= Decimal::ZERO {
                return invalid("must be negative");
            }
            if available + amount < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance);
            }
            (amount, Decimal::ZERO)
        }
        TxType::Commission => {
            if amount.is_zero() {
                return invalid("must be non-zero");
            }
            if amount < Decimal::ZERO && available + amount < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance);
            }
            (amount, Decimal::ZERO)
        }
        TxType::Withdraw => {
            if amount >= Decimal::ZERO {
                return invalid("must be negative");
            }
            if account.balance + amount < Decimal::ZERO || account.frozen + amount < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance);
            }
            (amount, amount)
        }
        TxType::Freeze => {
            if amount <= Decimal::ZERO {
                return invalid("freeze delta must be positive");
            }
            if available < amount {
                return Err(LedgerError::InsufficientBalance);
            }
            (Decimal::ZERO, amount)
        }
        TxType::Unfreeze => {
            if amount <= Decimal::ZERO {
                return invalid("unfreeze delta must be positive");
            }
            if account.frozen < amount {
                return Err(LedgerError::InvalidUnfreeze);
            }
            (Decimal::ZERO, -amount)
        }
    };

    let entry = JournalEntry {
        tx_no,
        kind: account.kind,
        principal_id: account.principal_id,
        tx_type,
        amount: delta,
        frozen_delta,
        balance_before: account.balance,
        balance_after: account.balance + delta,
        remark: remark.to_string(),
        audit_status,
        created_at: now,
    };
    Ok(Posting {
        entry,
        frozen_before: account.frozen,
        frozen_after: account.frozen + frozen_delta,
    })
}

#[derive(Clone)]
pub struct TransactionPoster {
    store: Arc<dyn Store>,
    registry: AccountRegistry,
    locks: LockManager,
}

impl TransactionPoster {
    pub fn new(store: Arc<dyn Store>, registry: AccountRegistry, locks: LockManager) -> Self {
        Self {
            store,
            registry,
            locks,
        }
    }

    /// Post one journal entry; returns its `tx_no`.
    pub async fn post(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
        tx_type: TxType,
        amount: Decimal,
        remark: &str,
        audit_status: AuditStatus,
    ) -> LedgerResult<String> {
        let (tx_no, _) = self
            .post_inner(kind, principal_id, tx_type, amount, remark, audit_status, None, None)
            .await?;
        Ok(tx_no)
    }

    /// Post with a caller-chosen `tx_no` (no collision retry)
    pub async fn post_as(
        &self,
        tx_no: &str,
        kind: AccountKind,
        principal_id: PrincipalId,
        tx_type: TxType,
        amount: Decimal,
        remark: &str,
        audit_status: AuditStatus,
    ) -> LedgerResult<String> {
        let (tx_no, _) = self
            .post_inner(kind, principal_id, tx_type, amount, remark, audit_status, Some(tx_no), None)
            .await?;
        Ok(tx_no)
    }

    /// Post and apply `change` in one store transaction; returns the `tx_no`
    /// and the application id. A lost status compare-and-set fails with
    /// `Conflict` and writes nothing.
    #[allow(clippy::too_many_arguments)]
    pub async fn post_with(
        &self,
        change: FundsChange<'_>,
        tx_no: Option<&str>,
        kind: AccountKind,
        principal_id: PrincipalId,
        tx_type: TxType,
        amount: Decimal,
        remark: &str,
        audit_status: AuditStatus,
    ) -> LedgerResult<(String, i64)> {
        let (tx_no, app_id) = self
            .post_inner(kind, principal_id, tx_type, amount, remark, audit_status, tx_no, Some(change))
            .await?;
        let app_id = app_id.ok_or_else(|| LedgerError::Internal(format!("{} committed without its application", tx_no)))?;
        Ok((tx_no, app_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn post_inner(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
        tx_type: TxType,
        amount: Decimal,
        remark: &str,
        audit_status: AuditStatus,
        fixed_tx_no: Option<&str>,
        change: Option<FundsChange<'_>>,
    ) -> LedgerResult<(String, Option<i64>)> {
        let lock = account_lock_name(kind, principal_id);
        let lease = self
            .locks
            .acquire_with_retry(&lock, ACCOUNT_LOCK_TTL, ACCOUNT_LOCK_WAIT)
            .await?;

        let result = self
            .post_locked(&lease, kind, principal_id, tx_type, amount, remark, audit_status, fixed_tx_no, change)
            .await;

        if let Err(e) = lease.release().await {
            tracing::warn!(lock = %lock, error = %e, "Failed to release account lease");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn post_locked(
        &self,
        lease: &Lease,
        kind: AccountKind,
        principal_id: PrincipalId,
        tx_type: TxType,
        amount: Decimal,
        remark: &str,
        audit_status: AuditStatus,
        fixed_tx_no: Option<&str>,
        change: Option<FundsChange<'_>>,
    ) -> LedgerResult<(String, Option<i64>)> {
        let attempts = if fixed_tx_no.is_some() { 1 } else { MAX_TX_NO_ATTEMPTS };
        let mut last_err = None;

        for _ in 0..attempts {
            let account = self.registry.get_or_create(kind, principal_id).await?;
            let now = Utc::now();
            let tx_no = fixed_tx_no
                .map(str::to_string)
                .unwrap_or_else(|| generate_tx_no(tx_type, now));
            let posting = plan_posting(&account, tx_type, amount, tx_no, remark, audit_status, now)?;

            lease.ensure_held()?;
            let committed = match change {
                None => self.store.apply_posting(&posting).await.map(|()| None),
                Some(change) => match self.store.commit_funds(&posting, change).await {
                    Ok(None) => {
                        return Err(LedgerError::Conflict(format!(
                            "{} lost its application status transition",
                            posting.entry.tx_no
                        )));
                    }
                    other => other,
                },
            };
            match committed {
                Ok(app_id) => {
                    let e = &posting.entry;
                    tracing::info!(
                        tx_no = %e.tx_no,
                        kind = %kind,
                        principal_id,
                        tx_type = %tx_type,
                        amount = %e.amount,
                        frozen_delta = %e.frozen_delta,
                        balance_after = %e.balance_after,
                        "Journal entry posted"
                    );
                    return Ok((posting.entry.tx_no, app_id));
                }
                Err(LedgerError::DuplicateTxNo(tx_no)) => {
                    tracing::debug!(tx_no = %tx_no, "tx_no collision, retrying");
                    last_err = Some(LedgerError::DuplicateTxNo(tx_no));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| LedgerError::Internal("posting loop exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::store::{AccountStore, MemoryStore};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn account(balance: &str, frozen: &str) -> Account {
        let mut a = Account::zero(AccountKind::Operator, 7);
        a.balance = dec(balance);
        a.frozen = dec(frozen);
        a
    }

    fn plan(a: &Account, t: TxType, amount: &str) -> LedgerResult<Posting> {
        plan_posting(a, t, dec(amount), "T1".into(), "", AuditStatus::Approved, Utc::now())
    }

    fn setup() -> (Arc<MemoryStore>, TransactionPoster) {
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(MemoryCoordStore::new());
        let registry = AccountRegistry::new(store.clone());
        let poster = TransactionPoster::new(store.clone(), registry, LockManager::new(coord));
        (store, poster)
    }

    #[test]
    fn test_tx_no_format() {
        let now = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.000012345Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(generate_tx_no(TxType::Withdraw, now), "WD202603040506072345");
    }

    #[test]
    fn test_freeze_and_unfreeze_rules() {
        let a = account("100", "40");
        let p = plan(&a, TxType::Freeze, "60").unwrap();
        assert_eq!(p.entry.amount, Decimal::ZERO);
        assert_eq!(p.frozen_after, dec("100"));
        assert!(matches!(plan(&a, TxType::Freeze, "60.0001"), Err(LedgerError::InsufficientBalance)));
        assert!(matches!(plan(&a, TxType::Unfreeze, "41"), Err(LedgerError::InvalidUnfreeze)));
        assert_eq!(plan(&a, TxType::Unfreeze, "40").unwrap().frozen_after, Decimal::ZERO);
    }

    #[test]
    fn test_debits_respect_reservations() {
        let a = account("100", "40");
        assert!(matches!(plan(&a, TxType::SettleOut, "-61"), Err(LedgerError::InsufficientBalance)));
        assert!(plan(&a, TxType::SettleOut, "-60").is_ok());
        assert!(matches!(plan(&a, TxType::Penalty, "-60.5"), Err(LedgerError::InsufficientBalance)));

        let w = plan(&a, TxType::Withdraw, "-40").unwrap();
        assert_eq!(w.entry.balance_after, dec("60"));
        assert_eq!(w.frozen_after, Decimal::ZERO);
        assert!(matches!(plan(&a, TxType::Withdraw, "-41"), Err(LedgerError::InsufficientBalance)));
    }

    #[test]
    fn test_sign_rules() {
        let a = account("10", "0");
        assert!(matches!(plan(&a, TxType::Recharge, "-1"), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(plan(&a, TxType::SettleIn, "-1"), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(plan(&a, TxType::Withdraw, "5"), Err(LedgerError::InvalidAmount(_))));

        let platform = Account::zero(AccountKind::PlatformCommission, 0);
        let loss = plan(&platform, TxType::SettleIn, "-10").unwrap();
        assert_eq!(loss.entry.balance_after, dec("-10"));
    }

    #[test]
    fn test_balance_chain_holds() {
        let a = account("12.3456", "0");
        let p = plan(&a, TxType::Subsidy, "0.00005").unwrap();
        assert_eq!(p.entry.balance_before + p.entry.amount, p.entry.balance_after);
        assert_eq!(p.entry.amount, dec("0.0001"));
    }

    #[tokio::test]
    async fn test_overdraw_leaves_single_entry() {
        let (store, poster) = setup();
        poster
            .post(AccountKind::Prepayment, 100, TxType::Recharge, dec("50.00"), "top-up", AuditStatus::Approved)
            .await
            .unwrap();
        let err = poster
            .post(AccountKind::Prepayment, 100, TxType::SettleOut, dec("-60.00"), "ops", AuditStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance));

        let a = store.get_account(AccountKind::Prepayment, 100).await.unwrap().unwrap();
        assert_eq!(a.balance, dec("50"));
        assert_eq!(store.journal_of(AccountKind::Prepayment, 100).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_posts_serialise() {
        let (store, poster) = setup();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let poster = poster.clone();
            handles.push(tokio::spawn(async move {
                poster
                    .post(AccountKind::Operator, 7, TxType::Recharge, dec("1.5"), "", AuditStatus::Approved)
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let a = store.get_account(AccountKind::Operator, 7).await.unwrap().unwrap();
        assert_eq!(a.balance, dec("30"));

        let journal = store.journal_of(AccountKind::Operator, 7);
        assert_eq!(journal.len(), 20);
        for pair in journal.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
        assert_eq!(journal.last().unwrap().balance_after, a.balance);
    }

    #[tokio::test]
    async fn test_platform_account_requires_principal_zero() {
        let (_, poster) = setup();
        let err = poster
            .post(AccountKind::PlatformCommission, 5, TxType::Recharge, dec("1"), "", AuditStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
