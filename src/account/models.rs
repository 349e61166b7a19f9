use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::PrincipalId;

/// Balance categories. Each (kind, principal) pair owns exactly one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// Shop-owner float that funds operations
    Prepayment = 1,
    /// Shop-owner security bond
    Deposit = 2,
    /// Operator earnings
    Operator = 3,
    /// Shop-owner earnings
    ShopOwnerCommission = 4,
    /// Singleton held by principal 0
    PlatformCommission = 5,
}

impl AccountKind {
    pub const ALL: [AccountKind; 5] = [
        AccountKind::Prepayment,
        AccountKind::Deposit,
        AccountKind::Operator,
        AccountKind::ShopOwnerCommission,
        AccountKind::PlatformCommission,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Prepayment => "prepayment",
            AccountKind::Deposit => "deposit",
            AccountKind::Operator => "operator",
            AccountKind::ShopOwnerCommission => "shop_owner_commission",
            AccountKind::PlatformCommission => "platform_commission",
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountKind::Prepayment),
            2 => Some(AccountKind::Deposit),
            3 => Some(AccountKind::Operator),
            4 => Some(AccountKind::ShopOwnerCommission),
            5 => Some(AccountKind::PlatformCommission),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccountKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Invalid account kind: {}", s))
    }
}

/// Journal entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Recharge = 1,
    Withdraw = 2,
    SettleIn = 3,
    SettleOut = 4,
    Penalty = 5,
    Subsidy = 6,
    Commission = 7,
    Freeze = 8,
    Unfreeze = 9,
}

impl TxType {
    pub const ALL: [TxType; 9] = [
        TxType::Recharge,
        TxType::Withdraw,
        TxType::SettleIn,
        TxType::SettleOut,
        TxType::Penalty,
        TxType::Subsidy,
        TxType::Commission,
        TxType::Freeze,
        TxType::Unfreeze,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Recharge => "recharge",
            TxType::Withdraw => "withdraw",
            TxType::SettleIn => "settle_in",
            TxType::SettleOut => "settle_out",
            TxType::Penalty => "penalty",
            TxType::Subsidy => "subsidy",
            TxType::Commission => "commission",
            TxType::Freeze => "freeze",
            TxType::Unfreeze => "unfreeze",
        }
    }

    /// Two-letter `tx_no` prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            TxType::Recharge => "RC",
            TxType::Withdraw => "WD",
            TxType::SettleIn => "SI",
            TxType::SettleOut => "SO",
            TxType::Penalty => "PN",
            TxType::Subsidy => "SB",
            TxType::Commission => "CM",
            TxType::Freeze => "FZ",
            TxType::Unfreeze => "UF",
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        TxType::ALL.into_iter().find(|t| *t as i16 == id)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Freeze/unfreeze move `frozen`, never `balance`
    #[inline]
    pub fn is_reservation(&self) -> bool {
        matches!(self, TxType::Freeze | TxType::Unfreeze)
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid transaction type: {}", s))
    }
}

/// Audit status carried on each journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
    Paid = 3,
}

impl From<i16> for AuditStatus {
    fn from(v: i16) -> Self {
        match v {
            0 => AuditStatus::Pending,
            2 => AuditStatus::Rejected,
            3 => AuditStatus::Paid,
            _ => AuditStatus::Approved,
        }
    }
}

/// Balance row for one (kind, principal)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub kind: AccountKind,
    pub principal_id: PrincipalId,
    pub balance: Decimal,
    pub frozen: Decimal,
    pub total_in: Decimal,
    pub total_out: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn zero(kind: AccountKind, principal_id: PrincipalId) -> Self {
        Self {
            kind,
            principal_id,
            balance: Decimal::ZERO,
            frozen: Decimal::ZERO,
            total_in: Decimal::ZERO,
            total_out: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Funds that may still be reserved or debited
    pub fn available(&self) -> Decimal {
        self.balance - self.frozen
    }
}

/// Immutable journal entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tx_no: String,
    pub kind: AccountKind,
    pub principal_id: PrincipalId,
    pub tx_type: TxType,
    /// Signed balance change (always 0 for freeze/unfreeze)
    pub amount: Decimal,
    /// Signed change of `frozen`
    pub frozen_delta: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub remark: String,
    pub audit_status: AuditStatus,
    pub created_at: DateTime<Utc>,
}

/// A fully checked balance mutation, ready to be applied atomically.
///
/// The store re-checks `entry.balance_before` and `frozen_before` against the
/// stored row and refuses the write on mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub entry: JournalEntry,
    pub frozen_before: Decimal,
    pub frozen_after: Decimal,
}

impl Posting {
    /// Account row after this posting is applied to `before`
    pub fn apply_to(&self, before: &Account) -> Account {
        let amount = self.entry.amount;
        let mut after = before.clone();
        after.balance = self.entry.balance_after;
        after.frozen = self.frozen_after;
        if amount > Decimal::ZERO {
            after.total_in += amount;
        } else if amount < Decimal::ZERO {
            after.total_out += -amount;
        }
        after.updated_at = self.entry.created_at;
        after
    }
}

/// Filter for journal listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalFilter {
    pub kind: Option<AccountKind>,
    pub principal_id: Option<PrincipalId>,
    pub tx_type: Option<TxType>,
}

impl JournalFilter {
    pub fn matches(&self, e: &JournalEntry) -> bool {
        self.kind.is_none_or(|k| k == e.kind)
            && self.principal_id.is_none_or(|p| p == e.principal_id)
            && self.tx_type.is_none_or(|t| t == e.tx_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_kind_names_and_ids() {
        for kind in AccountKind::ALL {
            assert_eq!(AccountKind::from_str(kind.as_str()).unwrap(), kind);
            assert_eq!(AccountKind::from_id(kind.id()), Some(kind));
        }
        assert!(AccountKind::from_str("spot").is_err());
    }

    #[test]
    fn test_tx_type_prefixes_are_unique() {
        let mut prefixes: Vec<&str> = TxType::ALL.iter().map(|t| t.prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), TxType::ALL.len());
        assert!(prefixes.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn test_posting_apply_tracks_totals() {
        let before = Account::zero(AccountKind::Operator, 7);
        let entry = JournalEntry {
            tx_no: "RC202601010000000001".into(),
            kind: AccountKind::Operator,
            principal_id: 7,
            tx_type: TxType::Recharge,
            amount: Decimal::from(25),
            frozen_delta: Decimal::ZERO,
            balance_before: Decimal::ZERO,
            balance_after: Decimal::from(25),
            remark: String::new(),
            audit_status: AuditStatus::Approved,
            created_at: Utc::now(),
        };
        let posting = Posting {
            entry,
            frozen_before: Decimal::ZERO,
            frozen_after: Decimal::ZERO,
        };
        let after = posting.apply_to(&before);
        assert_eq!(after.balance, Decimal::from(25));
        assert_eq!(after.total_in, Decimal::from(25));
        assert_eq!(after.total_out, Decimal::ZERO);
    }
}
