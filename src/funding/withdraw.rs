//! Withdraw Workflow
//!
//! ```text
//! submit        : freeze(amount)                  -> pending
//! approve       : pending  -> approved
//! reject        : pending  -> rejected, unfreeze(amount)
//! confirm_paid  : approved -> paid, withdraw(-amount)
//! ```
//!
//! Status transitions are compare-and-set in the store, so a second audit of
//! the same application fails with `AlreadyAudited` before any balance moves.
//! Every step that moves a balance commits its journal entry and the
//! application row in one store transaction.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::types::{AuditStamp, WithdrawApplication, WithdrawStatus};
use super::withdrawable_kind;
use crate::account::{AccountKind, AuditStatus, TransactionPoster, TxType, generate_tx_no};
use crate::core_types::{PrincipalId, Role};
use crate::directory::PrincipalDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::money::checked_money;
use crate::store::{FundsChange, Store};

#[derive(Clone)]
pub struct WithdrawWorkflow {
    store: Arc<dyn Store>,
    poster: TransactionPoster,
    directory: PrincipalDirectory,
}

impl WithdrawWorkflow {
    pub fn new(store: Arc<dyn Store>, poster: TransactionPoster, directory: PrincipalDirectory) -> Self {
        Self {
            store,
            poster,
            directory,
        }
    }

    /// Reserve `amount` and open a pending application
    pub async fn submit(
        &self,
        principal_id: PrincipalId,
        kind: AccountKind,
        amount: Decimal,
        collection_account_id: i64,
        remark: &str,
    ) -> LedgerResult<WithdrawApplication> {
        let amount = checked_money(amount)?;
        let principal = self.directory.get(principal_id).await?;
        if !principal.is_active() {
            return Err(LedgerError::Forbidden(format!("principal {} is disabled", principal_id)));
        }
        if !withdrawable_kind(principal.role, kind) {
            return Err(LedgerError::Forbidden(format!(
                "{} cannot withdraw from {}",
                principal.role.as_str(),
                kind
            )));
        }
        let collection = self.directory.get_collection_account(collection_account_id).await?;
        if collection.principal_id != principal_id {
            return Err(LedgerError::Forbidden(format!(
                "collection account {} belongs to another principal",
                collection_account_id
            )));
        }

        let now = Utc::now();
        let mut app = WithdrawApplication {
            id: 0,
            principal_id,
            kind,
            amount,
            collection_account_id,
            status: WithdrawStatus::Pending,
            freeze_tx_no: String::new(),
            settle_tx_no: None,
            auditor_id: None,
            remark: remark.to_string(),
            audit_remark: None,
            created_at: now,
            updated_at: now,
        };
        let (freeze_tx_no, id) = self
            .poster
            .post_with(
                FundsChange::OpenWithdraw(&app),
                None,
                kind,
                principal_id,
                TxType::Freeze,
                amount,
                "withdraw reserve",
                AuditStatus::Pending,
            )
            .await?;
        app.id = id;
        app.freeze_tx_no = freeze_tx_no;

        tracing::info!(
            withdraw_id = app.id,
            principal_id,
            kind = %kind,
            amount = %amount,
            freeze_tx_no = %app.freeze_tx_no,
            "Withdraw submitted"
        );
        Ok(app)
    }

    pub async fn get(&self, id: i64) -> LedgerResult<WithdrawApplication> {
        self.store
            .get_withdraw(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("withdraw application", id))
    }

    pub async fn list(&self, status: Option<WithdrawStatus>, limit: usize) -> LedgerResult<Vec<WithdrawApplication>> {
        self.store.list_withdraws(status, limit.clamp(1, 500)).await
    }

    pub async fn approve(&self, id: i64, auditor_id: PrincipalId, remark: Option<&str>) -> LedgerResult<WithdrawApplication> {
        self.directory.require_active(auditor_id, Role::Platform).await?;
        let stamp = AuditStamp {
            auditor_id,
            remark: remark.map(str::to_string),
            tx_no: None,
        };
        self.transition(id, WithdrawStatus::Pending, WithdrawStatus::Approved, &stamp)
            .await?;
        tracing::info!(withdraw_id = id, auditor_id, "Withdraw approved");
        self.get(id).await
    }

    pub async fn reject(&self, id: i64, auditor_id: PrincipalId, remark: Option<&str>) -> LedgerResult<WithdrawApplication> {
        self.directory.require_active(auditor_id, Role::Platform).await?;
        let app = self.get(id).await?;
        expect_status(&app, WithdrawStatus::Pending)?;
        let stamp = AuditStamp {
            auditor_id,
            remark: remark.map(str::to_string),
            tx_no: None,
        };
        let change = FundsChange::Withdraw {
            id,
            from: WithdrawStatus::Pending,
            to: WithdrawStatus::Rejected,
            stamp: &stamp,
        };
        if let Err(e) = self
            .poster
            .post_with(change, None, app.kind, app.principal_id, TxType::Unfreeze, app.amount, "withdraw rejected", AuditStatus::Rejected)
            .await
        {
            return Err(self.audit_error(id, WithdrawStatus::Pending, e).await);
        }
        tracing::info!(withdraw_id = id, auditor_id, amount = %app.amount, "Withdraw rejected");
        self.get(id).await
    }

    /// Funds left the platform: debit the balance and discharge the reserve
    pub async fn confirm_paid(&self, id: i64, auditor_id: PrincipalId) -> LedgerResult<WithdrawApplication> {
        self.directory.require_active(auditor_id, Role::Platform).await?;
        let app = self.get(id).await?;
        expect_status(&app, WithdrawStatus::Approved)?;
        let tx_no = generate_tx_no(TxType::Withdraw, Utc::now());
        let stamp = AuditStamp {
            auditor_id,
            remark: None,
            tx_no: Some(tx_no.clone()),
        };
        let change = FundsChange::Withdraw {
            id,
            from: WithdrawStatus::Approved,
            to: WithdrawStatus::Paid,
            stamp: &stamp,
        };
        if let Err(e) = self
            .poster
            .post_with(change, Some(&tx_no), app.kind, app.principal_id, TxType::Withdraw, -app.amount, "withdraw paid", AuditStatus::Paid)
            .await
        {
            return Err(self.audit_error(id, WithdrawStatus::Approved, e).await);
        }
        tracing::info!(withdraw_id = id, auditor_id, tx_no = %tx_no, amount = %app.amount, "Withdraw paid");
        self.get(id).await
    }

    async fn transition(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<()> {
        if self.store.transition_withdraw(id, from, to, stamp).await? {
            return Ok(());
        }
        let current = self.get(id).await?;
        Err(LedgerError::AlreadyAudited(current.status.id()))
    }

    /// `AlreadyAudited` when another audit moved the application first
    async fn audit_error(&self, id: i64, from: WithdrawStatus, err: LedgerError) -> LedgerError {
        match self.store.get_withdraw(id).await {
            Ok(Some(current)) if current.status != from => LedgerError::AlreadyAudited(current.status.id()),
            _ => err,
        }
    }
}

fn expect_status(app: &WithdrawApplication, status: WithdrawStatus) -> LedgerResult<()> {
    if app.status != status {
        return Err(LedgerError::AlreadyAudited(app.status.id()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountRegistry;
    use crate::coord::MemoryCoordStore;
    use crate::idgen::IdGenerator;
    use crate::lock::LockManager;
    use crate::store::memory::FaultPoint;
    use crate::store::{AccountStore, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        poster: TransactionPoster,
        directory: PrincipalDirectory,
        workflow: WithdrawWorkflow,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(MemoryCoordStore::new());
        let directory = PrincipalDirectory::new(store.clone(), Arc::new(IdGenerator::new(coord.clone())));
        let poster = TransactionPoster::new(
            store.clone(),
            AccountRegistry::new(store.clone()),
            LockManager::new(coord),
        );
        let workflow = WithdrawWorkflow::new(store.clone(), poster.clone(), directory.clone());
        Fixture {
            store,
            poster,
            directory,
            workflow,
        }
    }

    /// Funded shop owner, a payee card and an auditor
    async fn actors(f: &Fixture, funds: i64) -> (PrincipalId, i64, PrincipalId) {
        let owner = f.directory.create(Role::ShopOwner, "owner").await.unwrap();
        let card = f
            .directory
            .add_collection_account(owner.id, "bank", "6222000011112222", "Owner")
            .await
            .unwrap();
        let admin = f.directory.create(Role::Platform, "admin").await.unwrap();
        f.poster
            .post(AccountKind::Prepayment, owner.id, TxType::Recharge, Decimal::from(funds), "seed", AuditStatus::Approved)
            .await
            .unwrap();
        (owner.id, card.id, admin.id)
    }

    async fn account(f: &Fixture, pid: PrincipalId) -> (Decimal, Decimal) {
        let a = f.store.get_account(AccountKind::Prepayment, pid).await.unwrap().unwrap();
        (a.balance, a.frozen)
    }

    #[tokio::test]
    async fn test_submit_approve_pay() {
        let f = fixture();
        let (owner, card, admin) = actors(&f, 100).await;

        let app = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(50), card, "")
            .await
            .unwrap();
        assert_eq!(app.status, WithdrawStatus::Pending);
        assert_eq!(account(&f, owner).await, (Decimal::from(100), Decimal::from(50)));

        f.workflow.approve(app.id, admin, Some("ok")).await.unwrap();
        let paid = f.workflow.confirm_paid(app.id, admin).await.unwrap();
        assert_eq!(paid.status, WithdrawStatus::Paid);
        assert!(paid.settle_tx_no.as_deref().is_some_and(|t| t.starts_with("WD")));
        assert_eq!(account(&f, owner).await, (Decimal::from(50), Decimal::ZERO));

        let journal = f.store.journal_of(AccountKind::Prepayment, owner);
        let types: Vec<TxType> = journal.iter().map(|e| e.tx_type).collect();
        assert_eq!(types, vec![TxType::Recharge, TxType::Freeze, TxType::Withdraw]);
    }

    #[tokio::test]
    async fn test_reject_releases_reserve() {
        let f = fixture();
        let (owner, card, admin) = actors(&f, 100).await;
        let app = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(40), card, "")
            .await
            .unwrap();

        let rejected = f.workflow.reject(app.id, admin, Some("bad card")).await.unwrap();
        assert_eq!(rejected.status, WithdrawStatus::Rejected);
        assert_eq!(account(&f, owner).await, (Decimal::from(100), Decimal::ZERO));

        // double audit is refused before touching balances
        let err = f.workflow.approve(app.id, admin, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyAudited(2)));
        let err = f.workflow.confirm_paid(app.id, admin).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyAudited(2)));
        assert_eq!(f.store.journal_of(AccountKind::Prepayment, owner).len(), 3);
    }

    #[tokio::test]
    async fn test_submit_guards() {
        let f = fixture();
        let (owner, card, admin) = actors(&f, 30).await;

        let err = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(31), card, "")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance));

        let err = f
            .workflow
            .submit(owner, AccountKind::Operator, Decimal::from(1), card, "")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        let other = f.directory.create(Role::ShopOwner, "other").await.unwrap();
        let err = f
            .workflow
            .submit(other.id, AccountKind::Prepayment, Decimal::from(1), card, "")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));

        let app = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(10), card, "")
            .await
            .unwrap();
        // only platform principals audit
        let err = f.workflow.approve(app.id, owner, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Forbidden(_)));
        // paying needs approval first
        let err = f.workflow.confirm_paid(app.id, admin).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyAudited(0)));
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_reserve() {
        let f = fixture();
        let (owner, card, _) = actors(&f, 100).await;
        f.store.inject_fault(FaultPoint::InsertWithdraw);

        assert!(
            f.workflow
                .submit(owner, AccountKind::Prepayment, Decimal::from(50), card, "")
                .await
                .is_err()
        );
        assert_eq!(account(&f, owner).await, (Decimal::from(100), Decimal::ZERO));
        assert_eq!(f.store.journal_of(AccountKind::Prepayment, owner).len(), 1);
        assert!(f.workflow.list(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_payment_stays_approved() {
        let f = fixture();
        let (owner, card, admin) = actors(&f, 100).await;
        let app = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(50), card, "")
            .await
            .unwrap();
        f.workflow.approve(app.id, admin, None).await.unwrap();

        f.store.inject_fault(FaultPoint::CommitFunds);
        assert!(f.workflow.confirm_paid(app.id, admin).await.is_err());
        let stored = f.workflow.get(app.id).await.unwrap();
        assert_eq!(stored.status, WithdrawStatus::Approved);
        assert_eq!(stored.settle_tx_no, None);
        assert_eq!(account(&f, owner).await, (Decimal::from(100), Decimal::from(50)));

        f.workflow.confirm_paid(app.id, admin).await.unwrap();
        assert_eq!(account(&f, owner).await, (Decimal::from(50), Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_failed_reject_keeps_reserve() {
        let f = fixture();
        let (owner, card, admin) = actors(&f, 100).await;
        let app = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(30), card, "")
            .await
            .unwrap();

        f.store.inject_fault(FaultPoint::CommitFunds);
        assert!(f.workflow.reject(app.id, admin, None).await.is_err());
        assert_eq!(f.workflow.get(app.id).await.unwrap().status, WithdrawStatus::Pending);
        assert_eq!(account(&f, owner).await, (Decimal::from(100), Decimal::from(30)));
    }

    #[tokio::test]
    async fn test_concurrent_payments_debit_once() {
        let f = fixture();
        let (owner, card, admin) = actors(&f, 100).await;
        let app = f
            .workflow
            .submit(owner, AccountKind::Prepayment, Decimal::from(40), card, "")
            .await
            .unwrap();
        f.workflow.approve(app.id, admin, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let workflow = f.workflow.clone();
            handles.push(tokio::spawn(async move { workflow.confirm_paid(app.id, admin).await }));
        }
        let mut paid = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => paid += 1,
                Err(e) => assert!(matches!(e, LedgerError::AlreadyAudited(3)), "unexpected {:?}", e),
            }
        }
        assert_eq!(paid, 1);
        assert_eq!(account(&f, owner).await, (Decimal::from(60), Decimal::ZERO));
        assert_eq!(f.store.journal_of(AccountKind::Prepayment, owner).len(), 3);
    }
}
