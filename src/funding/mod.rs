//! Funding: withdraw and recharge applications with platform audit

pub mod recharge;
pub mod types;
pub mod withdraw;

use crate::account::AccountKind;
use crate::core_types::Role;

pub use recharge::RechargeWorkflow;
pub use types::{AuditStamp, RechargeApplication, RechargeStatus, WithdrawApplication, WithdrawStatus};
pub use withdraw::WithdrawWorkflow;

/// Account kinds a principal of `role` may withdraw from
pub fn withdrawable_kind(role: Role, kind: AccountKind) -> bool {
    match role {
        Role::ShopOwner => matches!(
            kind,
            AccountKind::Prepayment | AccountKind::Deposit | AccountKind::ShopOwnerCommission
        ),
        Role::Operator => kind == AccountKind::Operator,
        Role::Platform => false,
    }
}

/// Only shop-owner funding accounts take external money
pub fn rechargeable_kind(role: Role, kind: AccountKind) -> bool {
    role == Role::ShopOwner && matches!(kind, AccountKind::Prepayment | AccountKind::Deposit)
}
