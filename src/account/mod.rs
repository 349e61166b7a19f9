//! Accounts and the journal
//!
//! Balance rows keyed by (kind, principal), the append-only journal, and the
//! poster that is the only path allowed to change either.

pub mod models;
pub mod poster;
pub mod registry;

pub use models::{Account, AccountKind, AuditStatus, JournalEntry, JournalFilter, Posting, TxType};
pub use poster::{TransactionPoster, account_lock_name, generate_tx_no, plan_posting};
pub use registry::AccountRegistry;
