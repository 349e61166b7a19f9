//! Recharge Workflow
//!
//! `submit -> pending`, `approve` posts the credit, `complete` closes an
//! approved application once the transfer has been reconciled, `reject`
//! closes it without touching balances.
//!
//! Approval commits the credit and the status change in one store
//! transaction.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::rechargeable_kind;
use super::types::{AuditStamp, RechargeApplication, RechargeStatus};
use crate::account::{AccountKind, AuditStatus, TransactionPoster, TxType, generate_tx_no};
use crate::core_types::{PrincipalId, Role};
use crate::directory::PrincipalDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::money::checked_money;
use crate::store::{FundsChange, Store};

#[derive(Clone)]
pub struct RechargeWorkflow {
    store: Arc<dyn Store>,
    poster: TransactionPoster,
    directory: PrincipalDirectory,
}

impl RechargeWorkflow {
    pub fn new(store: Arc<dyn Store>, poster: TransactionPoster, directory: PrincipalDirectory) -> Self {
        Self {
            store,
            poster,
            directory,
        }
    }

    pub async fn submit(
        &self,
        principal_id: PrincipalId,
        kind: AccountKind,
        amount: Decimal,
        proof: &str,
    ) -> LedgerResult<RechargeApplication> {
        let amount = checked_money(amount)?;
        let principal = self.directory.require_active(principal_id, Role::ShopOwner).await?;
        if !rechargeable_kind(principal.role, kind) {
            return Err(LedgerError::Forbidden(format!("{} cannot be recharged", kind)));
        }
        if proof.trim().is_empty() {
            return Err(LedgerError::Validation("transfer proof is required".into()));
        }

        let now = Utc::now();
        let mut app = RechargeApplication {
            id: 0,
            principal_id,
            kind,
            amount,
            proof: proof.to_string(),
            status: RechargeStatus::Pending,
            tx_no: None,
            auditor_id: None,
            audit_remark: None,
            created_at: now,
            updated_at: now,
        };
        app.id = self.store.insert_recharge(&app).await?;
        tracing::info!(recharge_id = app.id, principal_id, kind = %kind, amount = %amount, "Recharge submitted");
        Ok(app)
    }

    pub async fn get(&self, id: i64) -> LedgerResult<RechargeApplication> {
        self.store
            .get_recharge(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("recharge application", id))
    }

    /// Credit the account. A second approval fails with `AlreadyAudited`.
    pub async fn approve(&self, id: i64, auditor_id: PrincipalId, remark: Option<&str>) -> LedgerResult<RechargeApplication> {
        self.directory.require_active(auditor_id, Role::Platform).await?;
        let app = self.get(id).await?;
        if app.status != RechargeStatus::Pending {
            return Err(LedgerError::AlreadyAudited(app.status.id()));
        }
        let tx_no = generate_tx_no(TxType::Recharge, Utc::now());
        let stamp = AuditStamp {
            auditor_id,
            remark: remark.map(str::to_string),
            tx_no: Some(tx_no.clone()),
        };
        let change = FundsChange::Recharge {
            id,
            from: RechargeStatus::Pending,
            to: RechargeStatus::Approved,
            stamp: &stamp,
        };
        if let Err(e) = self
            .poster
            .post_with(change, Some(&tx_no), app.kind, app.principal_id, TxType::Recharge, app.amount, "recharge approved", AuditStatus::Approved)
            .await
        {
            return Err(match self.store.get_recharge(id).await {
                Ok(Some(current)) if current.status != RechargeStatus::Pending => {
                    LedgerError::AlreadyAudited(current.status.id())
                }
                _ => e,
            });
        }
        tracing::info!(recharge_id = id, auditor_id, tx_no = %tx_no, amount = %app.amount, "Recharge approved");
        self.get(id).await
    }

    pub async fn complete(&self, id: i64, auditor_id: PrincipalId) -> LedgerResult<RechargeApplication> {
        self.directory.require_active(auditor_id, Role::Platform).await?;
        let stamp = AuditStamp {
            auditor_id,
            remark: None,
            tx_no: None,
        };
        self.transition(id, RechargeStatus::Approved, RechargeStatus::Complete, &stamp)
            .await?;
        self.get(id).await
    }

    pub async fn reject(&self, id: i64, auditor_id: PrincipalId, remark: Option<&str>) -> LedgerResult<RechargeApplication> {
        self.directory.require_active(auditor_id, Role::Platform).await?;
        let stamp = AuditStamp {
            auditor_id,
            remark: remark.map(str::to_string),
            tx_no: None,
        };
        self.transition(id, RechargeStatus::Pending, RechargeStatus::Rejected, &stamp)
            .await?;
        tracing::info!(recharge_id = id, auditor_id, "Recharge rejected");
        self.get(id).await
    }

    async fn transition(
        &self,
        id: i64,
        from: RechargeStatus,
        to: RechargeStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<()> {
        if self.store.transition_recharge(id, from, to, stamp).await? {
            return Ok(());
        }
        let current = self.get(id).await?;
        Err(LedgerError::AlreadyAudited(current.status.id()))
    }
}
