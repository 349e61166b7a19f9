use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::AccountKind;
use crate::core_types::PrincipalId;

/// Withdraw application status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum WithdrawStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
    Paid = 3,
}

impl WithdrawStatus {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(WithdrawStatus::Pending),
            1 => Some(WithdrawStatus::Approved),
            2 => Some(WithdrawStatus::Rejected),
            3 => Some(WithdrawStatus::Paid),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawStatus::Rejected | WithdrawStatus::Paid)
    }
}

/// Recharge application status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum RechargeStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
    Complete = 3,
}

impl RechargeStatus {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(RechargeStatus::Pending),
            1 => Some(RechargeStatus::Approved),
            2 => Some(RechargeStatus::Rejected),
            3 => Some(RechargeStatus::Complete),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawApplication {
    pub id: i64,
    pub principal_id: PrincipalId,
    pub kind: AccountKind,
    pub amount: Decimal,
    pub collection_account_id: i64,
    pub status: WithdrawStatus,
    pub freeze_tx_no: String,
    pub settle_tx_no: Option<String>,
    pub auditor_id: Option<PrincipalId>,
    pub remark: String,
    pub audit_remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RechargeApplication {
    pub id: i64,
    pub principal_id: PrincipalId,
    pub kind: AccountKind,
    pub amount: Decimal,
    /// Transfer receipt reference supplied by the applicant
    pub proof: String,
    pub status: RechargeStatus,
    pub tx_no: Option<String>,
    pub auditor_id: Option<PrincipalId>,
    pub audit_remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit decision recorded with a status transition
#[derive(Debug, Clone, PartialEq)]
pub struct AuditStamp {
    pub auditor_id: PrincipalId,
    pub remark: Option<String>,
    /// Journal entry produced by the transition, if any
    pub tx_no: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdraw_status_ids() {
        for s in [
            WithdrawStatus::Pending,
            WithdrawStatus::Approved,
            WithdrawStatus::Rejected,
            WithdrawStatus::Paid,
        ] {
            assert_eq!(WithdrawStatus::from_id(s.id()), Some(s));
        }
        assert!(WithdrawStatus::Paid.is_terminal());
        assert!(!WithdrawStatus::Approved.is_terminal());
        assert_eq!(WithdrawStatus::from_id(9), None);
    }

    #[test]
    fn test_recharge_status_ids() {
        assert_eq!(RechargeStatus::from_id(3), Some(RechargeStatus::Complete));
        assert_eq!(RechargeStatus::Approved.id(), 1);
    }
}
