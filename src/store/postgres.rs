//! PostgreSQL store
//!
//! Runtime-checked `sqlx` queries. Sharded tables are addressed through
//! [`ShardedTable::table_for`]; the physical name is interpolated, every value
//! is bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{
    AccountStore, CommerceStore, DirectoryStore, EventLogStore, FundsChange, StoreHealth, SyncStore,
    WorkflowStore,
};
use crate::account::{Account, AccountKind, AuditStatus, JournalEntry, JournalFilter, Posting, TxType};
use crate::core_types::{PrincipalId, PrincipalStatus, Role, ShopId};
use crate::error::{LedgerError, LedgerResult};
use crate::funding::{
    AuditStamp, RechargeApplication, RechargeStatus, WithdrawApplication, WithdrawStatus,
};
use crate::models::{
    CollectionAccount, Cooperation, CooperationStatus, Escrow, Order, Principal,
    ProfitShareConfig, Settlement, SettlementStatus, ShareRates, ShipmentRecord, ShipmentStatus,
    Shop, ShopStatus, TokenPair, WalletTransaction,
};
use crate::shard::{self, ShardedTable, table_name};
use crate::sync::{SyncRecord, SyncStatus, SyncType};
use crate::webhook::{EventLogEntry, EventOutcome};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Row-locked balance check, tx_no reservation, journal insert and
    /// balance update. Caller owns the transaction.
    async fn apply_posting_tx(
        tx: &mut Transaction<'_, Postgres>,
        posting: &Posting,
    ) -> LedgerResult<()> {
        let e = &posting.entry;
        let row = sqlx::query(
            "SELECT balance, frozen FROM accounts WHERE kind = $1 AND principal_id = $2 FOR UPDATE",
        )
        .bind(e.kind.id())
        .bind(e.principal_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", format!("{}:{}", e.kind, e.principal_id)))?;

        let balance: Decimal = row.try_get("balance")?;
        let frozen: Decimal = row.try_get("frozen")?;
        if balance != e.balance_before || frozen != posting.frozen_before {
            return Err(LedgerError::Integrity(format!(
                "stale posting {}: stored balance {} frozen {}, expected {} / {}",
                e.tx_no, balance, frozen, e.balance_before, posting.frozen_before
            )));
        }

        let shard_idx = shard::index(e.principal_id);
        sqlx::query("INSERT INTO journal_tx_nos (tx_no, shard) VALUES ($1, $2)")
            .bind(&e.tx_no)
            .bind(shard_idx as i16)
            .execute(&mut **tx)
            .await?;

        let sql = format!(
            r#"INSERT INTO {} (tx_no, kind, principal_id, tx_type, amount, frozen_delta,
                   balance_before, balance_after, remark, audit_status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
            table_name(ShardedTable::AccountTransactions.logical_name(), shard_idx)
        );
        sqlx::query(&sql)
            .bind(&e.tx_no)
            .bind(e.kind.id())
            .bind(e.principal_id)
            .bind(e.tx_type.id())
            .bind(e.amount)
            .bind(e.frozen_delta)
            .bind(e.balance_before)
            .bind(e.balance_after)
            .bind(&e.remark)
            .bind(e.audit_status as i16)
            .bind(e.created_at)
            .execute(&mut **tx)
            .await?;

        let (credit, debit) = if e.amount >= Decimal::ZERO {
            (e.amount, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -e.amount)
        };
        sqlx::query(
            r#"UPDATE accounts
               SET balance = $3, frozen = $4, total_in = total_in + $5,
                   total_out = total_out + $6, updated_at = $7
               WHERE kind = $1 AND principal_id = $2"#,
        )
        .bind(e.kind.id())
        .bind(e.principal_id)
        .bind(e.balance_after)
        .bind(posting.frozen_after)
        .bind(credit)
        .bind(debit)
        .bind(e.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn upsert_settlement_tx(
        tx: &mut Transaction<'_, Postgres>,
        s: &Settlement,
        status: SettlementStatus,
        journal_posted: bool,
    ) -> LedgerResult<()> {
        let sql = format!(
            r#"INSERT INTO {} (shop_id, order_sn, operator_id, shop_owner_id, gross, cost, net,
                   platform_share, operator_share, shop_owner_share, status, journal_posted,
                   needs_adjustment, last_error, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
               ON CONFLICT (shop_id, order_sn) DO UPDATE SET
                   operator_id = EXCLUDED.operator_id, shop_owner_id = EXCLUDED.shop_owner_id,
                   gross = EXCLUDED.gross, cost = EXCLUDED.cost, net = EXCLUDED.net,
                   platform_share = EXCLUDED.platform_share,
                   operator_share = EXCLUDED.operator_share,
                   shop_owner_share = EXCLUDED.shop_owner_share,
                   status = EXCLUDED.status, journal_posted = EXCLUDED.journal_posted,
                   last_error = EXCLUDED.last_error, updated_at = NOW()
               WHERE {}.status <> 1"#,
            ShardedTable::Settlements.table_for(s.shop_id),
            ShardedTable::Settlements.table_for(s.shop_id),
        );
        sqlx::query(&sql)
            .bind(s.shop_id)
            .bind(&s.order_sn)
            .bind(s.operator_id)
            .bind(s.shop_owner_id)
            .bind(s.gross)
            .bind(s.cost)
            .bind(s.net)
            .bind(s.platform_share)
            .bind(s.operator_share)
            .bind(s.shop_owner_share)
            .bind(status as i16)
            .bind(journal_posted)
            .bind(s.needs_adjustment)
            .bind(&s.last_error)
            .bind(s.created_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn decode_err(what: &str, value: impl std::fmt::Display) -> LedgerError {
    LedgerError::Integrity(format!("unknown {} value in storage: {}", what, value))
}

fn account_from_row(row: &PgRow) -> LedgerResult<Account> {
    let kind: i16 = row.try_get("kind")?;
    Ok(Account {
        kind: AccountKind::from_id(kind).ok_or_else(|| decode_err("account kind", kind))?,
        principal_id: row.try_get("principal_id")?,
        balance: row.try_get("balance")?,
        frozen: row.try_get("frozen")?,
        total_in: row.try_get("total_in")?,
        total_out: row.try_get("total_out")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn journal_from_row(row: &PgRow) -> LedgerResult<JournalEntry> {
    let kind: i16 = row.try_get("kind")?;
    let tx_type: i16 = row.try_get("tx_type")?;
    let audit: i16 = row.try_get("audit_status")?;
    Ok(JournalEntry {
        tx_no: row.try_get("tx_no")?,
        kind: AccountKind::from_id(kind).ok_or_else(|| decode_err("account kind", kind))?,
        principal_id: row.try_get("principal_id")?,
        tx_type: TxType::from_id(tx_type).ok_or_else(|| decode_err("tx type", tx_type))?,
        amount: row.try_get("amount")?,
        frozen_delta: row.try_get("frozen_delta")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        remark: row.try_get("remark")?,
        audit_status: AuditStatus::from(audit),
        created_at: row.try_get("created_at")?,
    })
}

fn principal_from_row(row: &PgRow) -> LedgerResult<Principal> {
    let role: i16 = row.try_get("role")?;
    let status: i16 = row.try_get("status")?;
    Ok(Principal {
        id: row.try_get("id")?,
        role: Role::from_id(role).ok_or_else(|| decode_err("role", role))?,
        username: row.try_get("username")?,
        status: PrincipalStatus::from(status),
        created_at: row.try_get("created_at")?,
    })
}

fn collection_account_from_row(row: &PgRow) -> LedgerResult<CollectionAccount> {
    Ok(CollectionAccount {
        id: row.try_get("id")?,
        principal_id: row.try_get("principal_id")?,
        channel: row.try_get("channel")?,
        account_no: row.try_get("account_no")?,
        holder_name: row.try_get("holder_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn shop_from_row(row: &PgRow) -> LedgerResult<Shop> {
    let status: i16 = row.try_get("status")?;
    let access_token: Option<String> = row.try_get("access_token")?;
    let refresh_token: Option<String> = row.try_get("refresh_token")?;
    let expire_at: Option<DateTime<Utc>> = row.try_get("token_expire_at")?;
    let tokens = match (access_token, refresh_token, expire_at) {
        (Some(access_token), Some(refresh_token), Some(expire_at)) => Some(TokenPair {
            access_token,
            refresh_token,
            expire_at,
        }),
        _ => None,
    };
    Ok(Shop {
        shop_id: row.try_get("shop_id")?,
        owner_id: row.try_get("owner_id")?,
        status: ShopStatus::from(status),
        tokens,
        region: row.try_get("region")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cooperation_from_row(row: &PgRow) -> LedgerResult<Cooperation> {
    let status: i16 = row.try_get("status")?;
    Ok(Cooperation {
        id: row.try_get("id")?,
        shop_id: row.try_get("shop_id")?,
        operator_id: row.try_get("operator_id")?,
        status: CooperationStatus::from(status),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> LedgerResult<Order> {
    Ok(Order {
        shop_id: row.try_get("shop_id")?,
        order_sn: row.try_get("order_sn")?,
        status: row.try_get("status")?,
        local_status_lock: row.try_get("local_status_lock")?,
        total_amount: row.try_get("total_amount")?,
        currency: row.try_get("currency")?,
        upstream_update_time: row.try_get("upstream_update_time")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn shipment_from_row(row: &PgRow) -> LedgerResult<ShipmentRecord> {
    let status: i16 = row.try_get("status")?;
    Ok(ShipmentRecord {
        id: row.try_get("id")?,
        shop_id: row.try_get("shop_id")?,
        order_sn: row.try_get("order_sn")?,
        operator_id: row.try_get("operator_id")?,
        goods_cost: row.try_get("goods_cost")?,
        shipping_cost: row.try_get("shipping_cost")?,
        tracking_no: row.try_get("tracking_no")?,
        self_funded: row.try_get("self_funded")?,
        status: ShipmentStatus::from_id(status).ok_or_else(|| decode_err("shipment status", status))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn escrow_from_row(row: &PgRow) -> LedgerResult<Escrow> {
    let raw: String = row.try_get("raw")?;
    Ok(Escrow {
        shop_id: row.try_get("shop_id")?,
        order_sn: row.try_get("order_sn")?,
        seller_receive_amount: row.try_get("seller_receive_amount")?,
        commission_fee: row.try_get("commission_fee")?,
        service_fee: row.try_get("service_fee")?,
        raw: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
        synced_at: row.try_get("synced_at")?,
    })
}

fn settlement_from_row(row: &PgRow) -> LedgerResult<Settlement> {
    let status: i16 = row.try_get("status")?;
    Ok(Settlement {
        shop_id: row.try_get("shop_id")?,
        order_sn: row.try_get("order_sn")?,
        operator_id: row.try_get("operator_id")?,
        shop_owner_id: row.try_get("shop_owner_id")?,
        gross: row.try_get("gross")?,
        cost: row.try_get("cost")?,
        net: row.try_get("net")?,
        platform_share: row.try_get("platform_share")?,
        operator_share: row.try_get("operator_share")?,
        shop_owner_share: row.try_get("shop_owner_share")?,
        status: SettlementStatus::from(status),
        journal_posted: row.try_get("journal_posted")?,
        needs_adjustment: row.try_get("needs_adjustment")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_record_from_row(row: &PgRow) -> LedgerResult<SyncRecord> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: i16 = row.try_get("status")?;
    Ok(SyncRecord {
        shop_id: row.try_get("shop_id")?,
        sync_type: sync_type
            .parse()
            .map_err(|_| decode_err("sync type", &sync_type))?,
        cursor_ts: row.try_get("cursor_ts")?,
        page_marker: row.try_get("page_marker")?,
        window_end: row.try_get("window_end")?,
        status: SyncStatus::from(status),
        consecutive_fail_count: row.try_get("consecutive_fail_count")?,
        total_synced_count: row.try_get("total_synced_count")?,
        last_error: row.try_get("last_error")?,
        last_synced_at: row.try_get("last_synced_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn withdraw_from_row(row: &PgRow) -> LedgerResult<WithdrawApplication> {
    let kind: i16 = row.try_get("kind")?;
    let status: i16 = row.try_get("status")?;
    Ok(WithdrawApplication {
        id: row.try_get("id")?,
        principal_id: row.try_get("principal_id")?,
        kind: AccountKind::from_id(kind).ok_or_else(|| decode_err("account kind", kind))?,
        amount: row.try_get("amount")?,
        collection_account_id: row.try_get("collection_account_id")?,
        status: WithdrawStatus::from_id(status).ok_or_else(|| decode_err("withdraw status", status))?,
        freeze_tx_no: row.try_get("freeze_tx_no")?,
        settle_tx_no: row.try_get("settle_tx_no")?,
        auditor_id: row.try_get("auditor_id")?,
        remark: row.try_get("remark")?,
        audit_remark: row.try_get("audit_remark")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn recharge_from_row(row: &PgRow) -> LedgerResult<RechargeApplication> {
    let kind: i16 = row.try_get("kind")?;
    let status: i16 = row.try_get("status")?;
    Ok(RechargeApplication {
        id: row.try_get("id")?,
        principal_id: row.try_get("principal_id")?,
        kind: AccountKind::from_id(kind).ok_or_else(|| decode_err("account kind", kind))?,
        amount: row.try_get("amount")?,
        proof: row.try_get("proof")?,
        status: RechargeStatus::from_id(status).ok_or_else(|| decode_err("recharge status", status))?,
        tx_no: row.try_get("tx_no")?,
        auditor_id: row.try_get("auditor_id")?,
        audit_remark: row.try_get("audit_remark")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_outcome(s: &str) -> EventOutcome {
    match s {
        "applied" => EventOutcome::Applied,
        "recorded" => EventOutcome::Recorded,
        "duplicate" => EventOutcome::Duplicate,
        "flagged" => EventOutcome::Flagged,
        "failed" => EventOutcome::Failed,
        _ => EventOutcome::Ignored,
    }
}

fn event_log_from_row(row: &PgRow) -> LedgerResult<EventLogEntry> {
    let outcome: String = row.try_get("outcome")?;
    Ok(EventLogEntry {
        id: row.try_get("id")?,
        shop_id: row.try_get("shop_id")?,
        code: row.try_get("code")?,
        order_sn: row.try_get("order_sn")?,
        upstream_timestamp: row.try_get("upstream_timestamp")?,
        outcome: event_outcome(&outcome),
        detail: row.try_get("detail")?,
        raw: row.try_get("raw")?,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl AccountStore for PgStore {
    async fn get_account(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE kind = $1 AND principal_id = $2")
            .bind(kind.id())
            .bind(principal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn create_account_if_absent(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO accounts (kind, principal_id) VALUES ($1, $2) ON CONFLICT (kind, principal_id) DO NOTHING",
        )
        .bind(kind.id())
        .bind(principal_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_accounts(&self, principal_id: PrincipalId) -> LedgerResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE principal_id = $1 ORDER BY kind")
            .bind(principal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn apply_posting(&self, posting: &Posting) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::apply_posting_tx(&mut tx, posting).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_journal_shard(
        &self,
        shard: usize,
        filter: &JournalFilter,
        offset: usize,
        limit: usize,
    ) -> LedgerResult<Vec<JournalEntry>> {
        let sql = format!(
            r#"SELECT * FROM {}
               WHERE ($1::SMALLINT IS NULL OR kind = $1)
                 AND ($2::BIGINT IS NULL OR principal_id = $2)
                 AND ($3::SMALLINT IS NULL OR tx_type = $3)
               ORDER BY created_at DESC, id DESC
               OFFSET $4 LIMIT $5"#,
            table_name(ShardedTable::AccountTransactions.logical_name(), shard)
        );
        let rows = sqlx::query(&sql)
            .bind(filter.kind.map(|k| k.id()))
            .bind(filter.principal_id)
            .bind(filter.tx_type.map(|t| t.id()))
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(journal_from_row).collect()
    }
}

#[async_trait]
impl DirectoryStore for PgStore {
    async fn insert_principal(&self, principal: &Principal) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO principals (id, role, username, status, created_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(principal.id)
        .bind(principal.role.id())
        .bind(&principal.username)
        .bind(principal.status as i16)
        .bind(principal.created_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if db.constraint() == Some("principals_pkey") {
                    Err(LedgerError::Integrity(format!(
                        "principal id {} already issued",
                        principal.id
                    )))
                } else {
                    Err(LedgerError::Conflict(format!(
                        "username {} already taken",
                        principal.username
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_principal(&self, id: PrincipalId) -> LedgerResult<Option<Principal>> {
        let row = sqlx::query("SELECT * FROM principals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(principal_from_row).transpose()
    }

    async fn set_principal_status(
        &self,
        id: PrincipalId,
        status: PrincipalStatus,
    ) -> LedgerResult<bool> {
        let result = sqlx::query("UPDATE principals SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status as i16)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_collection_account(&self, account: &CollectionAccount) -> LedgerResult<i64> {
        let row = sqlx::query(
            r#"INSERT INTO collection_accounts (principal_id, channel, account_no, holder_name, created_at)
               VALUES ($1, $2, $3, $4, $5) RETURNING id"#,
        )
        .bind(account.principal_id)
        .bind(&account.channel)
        .bind(&account.account_no)
        .bind(&account.holder_name)
        .bind(account.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_collection_account(&self, id: i64) -> LedgerResult<Option<CollectionAccount>> {
        let row = sqlx::query("SELECT * FROM collection_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(collection_account_from_row).transpose()
    }
}

#[async_trait]
impl CommerceStore for PgStore {
    async fn get_shop(&self, shop_id: ShopId) -> LedgerResult<Option<Shop>> {
        let row = sqlx::query("SELECT * FROM shops WHERE shop_id = $1")
            .bind(shop_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(shop_from_row).transpose()
    }

    async fn save_shop(&self, shop: &Shop) -> LedgerResult<()> {
        let tokens = shop.tokens.as_ref();
        sqlx::query(
            r#"INSERT INTO shops (shop_id, owner_id, status, access_token, refresh_token,
                   token_expire_at, region, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (shop_id) DO UPDATE SET
                   owner_id = EXCLUDED.owner_id, status = EXCLUDED.status,
                   access_token = EXCLUDED.access_token, refresh_token = EXCLUDED.refresh_token,
                   token_expire_at = EXCLUDED.token_expire_at, region = EXCLUDED.region,
                   updated_at = EXCLUDED.updated_at"#,
        )
        .bind(shop.shop_id)
        .bind(shop.owner_id)
        .bind(shop.status as i16)
        .bind(tokens.map(|t| t.access_token.clone()))
        .bind(tokens.map(|t| t.refresh_token.clone()))
        .bind(tokens.map(|t| t.expire_at))
        .bind(&shop.region)
        .bind(shop.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_active_cooperation(&self, shop_id: ShopId) -> LedgerResult<Option<Cooperation>> {
        let row = sqlx::query("SELECT * FROM cooperations WHERE shop_id = $1 AND status = 1")
            .bind(shop_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cooperation_from_row).transpose()
    }

    async fn insert_cooperation(&self, coop: &Cooperation) -> LedgerResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO cooperations (shop_id, operator_id, status, created_at, updated_at)
               VALUES ($1, $2, 1, $3, $3) RETURNING id"#,
        )
        .bind(coop.shop_id)
        .bind(coop.operator_id)
        .bind(coop.created_at)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(row) => Ok(row.try_get("id")?),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                LedgerError::Conflict(format!("shop {} already has an active operator", coop.shop_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_cooperation(&self, shop_id: ShopId) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE cooperations SET status = 0, updated_at = NOW() WHERE shop_id = $1 AND status = 1",
        )
        .bind(shop_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_profit_share(&self, config: &ProfitShareConfig) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO profit_share_configs
                   (shop_id, operator_id, platform_rate, operator_rate, shop_owner_rate, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (shop_id, operator_id) DO UPDATE SET
                   platform_rate = EXCLUDED.platform_rate, operator_rate = EXCLUDED.operator_rate,
                   shop_owner_rate = EXCLUDED.shop_owner_rate, updated_at = EXCLUDED.updated_at"#,
        )
        .bind(config.shop_id)
        .bind(config.operator_id)
        .bind(config.rates.platform)
        .bind(config.rates.operator)
        .bind(config.rates.shop_owner)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_profit_share(
        &self,
        shop_id: ShopId,
        operator_id: PrincipalId,
    ) -> LedgerResult<Option<ProfitShareConfig>> {
        let row = sqlx::query(
            "SELECT * FROM profit_share_configs WHERE shop_id = $1 AND operator_id = $2",
        )
        .bind(shop_id)
        .bind(operator_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ProfitShareConfig {
            shop_id: row.try_get("shop_id")?,
            operator_id: row.try_get("operator_id")?,
            rates: ShareRates {
                platform: row.try_get("platform_rate")?,
                operator: row.try_get("operator_rate")?,
                shop_owner: row.try_get("shop_owner_rate")?,
            },
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn upsert_order(&self, order: &Order) -> LedgerResult<()> {
        let sql = format!(
            r#"INSERT INTO {} (shop_id, order_sn, status, local_status_lock, total_amount, currency,
                   upstream_update_time, first_seen_at, last_synced_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (shop_id, order_sn) DO UPDATE SET
                   status = EXCLUDED.status, local_status_lock = EXCLUDED.local_status_lock,
                   total_amount = EXCLUDED.total_amount, currency = EXCLUDED.currency,
                   upstream_update_time = EXCLUDED.upstream_update_time,
                   last_synced_at = EXCLUDED.last_synced_at"#,
            ShardedTable::Orders.table_for(order.shop_id)
        );
        sqlx::query(&sql)
            .bind(order.shop_id)
            .bind(&order.order_sn)
            .bind(&order.status)
            .bind(&order.local_status_lock)
            .bind(order.total_amount)
            .bind(&order.currency)
            .bind(order.upstream_update_time)
            .bind(order.first_seen_at)
            .bind(order.last_synced_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_order(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<Option<Order>> {
        let sql = format!(
            "SELECT * FROM {} WHERE shop_id = $1 AND order_sn = $2",
            ShardedTable::Orders.table_for(shop_id)
        );
        let row = sqlx::query(&sql)
            .bind(shop_id)
            .bind(order_sn)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn list_orders_missing_escrow(
        &self,
        shop_id: ShopId,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> LedgerResult<Vec<Order>> {
        let sql = format!(
            r#"SELECT o.* FROM {} o
               LEFT JOIN {} e ON e.shop_id = o.shop_id AND e.order_sn = o.order_sn
               WHERE o.shop_id = $1 AND e.order_sn IS NULL
                 AND COALESCE(o.local_status_lock, o.status) = 'COMPLETED'
                 AND ($2::BIGINT IS NULL OR (o.upstream_update_time, o.order_sn) > ($2, $3))
               ORDER BY o.upstream_update_time, o.order_sn
               LIMIT $4"#,
            ShardedTable::Orders.table_for(shop_id),
            ShardedTable::Escrows.table_for(shop_id),
        );
        let rows = sqlx::query(&sql)
            .bind(shop_id)
            .bind(after.map(|(ts, _)| ts))
            .bind(after.map_or("", |(_, sn)| sn))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn insert_shipment(&self, s: &ShipmentRecord) -> LedgerResult<i64> {
        let sql = format!(
            r#"INSERT INTO {} (shop_id, order_sn, operator_id, goods_cost, shipping_cost,
                   tracking_no, self_funded, status, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING id"#,
            ShardedTable::ShipmentRecords.table_for(s.shop_id)
        );
        let row = sqlx::query(&sql)
            .bind(s.shop_id)
            .bind(&s.order_sn)
            .bind(s.operator_id)
            .bind(s.goods_cost)
            .bind(s.shipping_cost)
            .bind(&s.tracking_no)
            .bind(s.self_funded)
            .bind(s.status.id())
            .bind(s.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_shipment(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<Option<ShipmentRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE shop_id = $1 AND order_sn = $2 ORDER BY id DESC LIMIT 1",
            ShardedTable::ShipmentRecords.table_for(shop_id)
        );
        let row = sqlx::query(&sql)
            .bind(shop_id)
            .bind(order_sn)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(shipment_from_row).transpose()
    }

    async fn update_shipment_tracking(
        &self,
        shop_id: ShopId,
        shipment_id: i64,
        tracking_no: &str,
    ) -> LedgerResult<bool> {
        let sql = format!(
            "UPDATE {} SET tracking_no = $3, updated_at = NOW() WHERE shop_id = $1 AND id = $2",
            ShardedTable::ShipmentRecords.table_for(shop_id)
        );
        let result = sqlx::query(&sql)
            .bind(shop_id)
            .bind(shipment_id)
            .bind(tracking_no)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_shipment_status(
        &self,
        shop_id: ShopId,
        shipment_id: i64,
        from: ShipmentStatus,
        to: ShipmentStatus,
    ) -> LedgerResult<bool> {
        let sql = format!(
            "UPDATE {} SET status = $4, updated_at = NOW() WHERE shop_id = $1 AND id = $2 AND status = $3",
            ShardedTable::ShipmentRecords.table_for(shop_id)
        );
        let result = sqlx::query(&sql)
            .bind(shop_id)
            .bind(shipment_id)
            .bind(from.id())
            .bind(to.id())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_shipments_by_status(
        &self,
        shard: usize,
        status: ShipmentStatus,
        after_id: i64,
        limit: usize,
    ) -> LedgerResult<Vec<ShipmentRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = $1 AND id > $2 ORDER BY id LIMIT $3",
            table_name(ShardedTable::ShipmentRecords.logical_name(), shard)
        );
        let rows = sqlx::query(&sql)
            .bind(status.id())
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(shipment_from_row).collect()
    }

    async fn upsert_escrow(&self, escrow: &Escrow) -> LedgerResult<()> {
        let sql = format!(
            r#"INSERT INTO {} (shop_id, order_sn, seller_receive_amount, commission_fee,
                   service_fee, raw, synced_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (shop_id, order_sn) DO UPDATE SET
                   seller_receive_amount = EXCLUDED.seller_receive_amount,
                   commission_fee = EXCLUDED.commission_fee, service_fee = EXCLUDED.service_fee,
                   raw = EXCLUDED.raw, synced_at = EXCLUDED.synced_at"#,
            ShardedTable::Escrows.table_for(escrow.shop_id)
        );
        sqlx::query(&sql)
            .bind(escrow.shop_id)
            .bind(&escrow.order_sn)
            .bind(escrow.seller_receive_amount)
            .bind(escrow.commission_fee)
            .bind(escrow.service_fee)
            .bind(escrow.raw.to_string())
            .bind(escrow.synced_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_escrow(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<Option<Escrow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE shop_id = $1 AND order_sn = $2",
            ShardedTable::Escrows.table_for(shop_id)
        );
        let row = sqlx::query(&sql)
            .bind(shop_id)
            .bind(order_sn)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn upsert_wallet_transaction(&self, t: &WalletTransaction) -> LedgerResult<()> {
        let sql = format!(
            r#"INSERT INTO {} (shop_id, transaction_id, order_sn, transaction_type, amount,
                   create_time, synced_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (shop_id, transaction_id) DO UPDATE SET
                   order_sn = EXCLUDED.order_sn, transaction_type = EXCLUDED.transaction_type,
                   amount = EXCLUDED.amount, create_time = EXCLUDED.create_time,
                   synced_at = EXCLUDED.synced_at"#,
            ShardedTable::WalletTransactions.table_for(t.shop_id)
        );
        sqlx::query(&sql)
            .bind(t.shop_id)
            .bind(t.transaction_id)
            .bind(&t.order_sn)
            .bind(&t.transaction_type)
            .bind(t.amount)
            .bind(t.create_time)
            .bind(t.synced_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_settlement(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<Option<Settlement>> {
        let sql = format!(
            "SELECT * FROM {} WHERE shop_id = $1 AND order_sn = $2",
            ShardedTable::Settlements.table_for(shop_id)
        );
        let row = sqlx::query(&sql)
            .bind(shop_id)
            .bind(order_sn)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(settlement_from_row).transpose()
    }

    async fn save_open_settlement(&self, settlement: &Settlement) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_settlement_tx(&mut tx, settlement, settlement.status, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_settlement(
        &self,
        settlement: &Settlement,
        postings: &[Posting],
        shipment_id: i64,
    ) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT status FROM {} WHERE shop_id = $1 AND order_sn = $2 FOR UPDATE",
            ShardedTable::Settlements.table_for(settlement.shop_id)
        );
        let existing = sqlx::query(&select)
            .bind(settlement.shop_id)
            .bind(&settlement.order_sn)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            let status: i16 = row.try_get("status")?;
            if SettlementStatus::from(status) == SettlementStatus::Completed {
                return Err(LedgerError::Conflict(format!(
                    "settlement {}:{} already completed",
                    settlement.shop_id, settlement.order_sn
                )));
            }
        }

        let update = format!(
            "UPDATE {} SET status = 2, updated_at = NOW() WHERE shop_id = $1 AND id = $2 AND status = 1",
            ShardedTable::ShipmentRecords.table_for(settlement.shop_id)
        );
        let moved = sqlx::query(&update)
            .bind(settlement.shop_id)
            .bind(shipment_id)
            .execute(&mut *tx)
            .await?;
        if moved.rows_affected() != 1 {
            return Err(LedgerError::Conflict(format!(
                "shipment {} is not pending settlement",
                shipment_id
            )));
        }

        for posting in postings {
            Self::apply_posting_tx(&mut tx, posting).await?;
        }
        Self::upsert_settlement_tx(&mut tx, settlement, SettlementStatus::Completed, true).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn flag_settlement_adjustment(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<bool> {
        let sql = format!(
            "UPDATE {} SET needs_adjustment = TRUE, updated_at = NOW() WHERE shop_id = $1 AND order_sn = $2",
            ShardedTable::Settlements.table_for(shop_id)
        );
        let result = sqlx::query(&sql)
            .bind(shop_id)
            .bind(order_sn)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn get_sync_record(
        &self,
        shop_id: ShopId,
        sync_type: SyncType,
    ) -> LedgerResult<Option<SyncRecord>> {
        let row = sqlx::query("SELECT * FROM shop_sync_records WHERE shop_id = $1 AND sync_type = $2")
            .bind(shop_id)
            .bind(sync_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sync_record_from_row).transpose()
    }

    async fn save_sync_record(&self, r: &SyncRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"INSERT INTO shop_sync_records (shop_id, sync_type, cursor_ts, page_marker, status,
                   consecutive_fail_count, total_synced_count, last_error, last_synced_at, updated_at,
                   window_end)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (shop_id, sync_type) DO UPDATE SET
                   cursor_ts = EXCLUDED.cursor_ts, page_marker = EXCLUDED.page_marker,
                   window_end = EXCLUDED.window_end, status = EXCLUDED.status,
                   consecutive_fail_count = EXCLUDED.consecutive_fail_count,
                   total_synced_count = EXCLUDED.total_synced_count,
                   last_error = EXCLUDED.last_error, last_synced_at = EXCLUDED.last_synced_at,
                   updated_at = EXCLUDED.updated_at"#,
        )
        .bind(r.shop_id)
        .bind(r.sync_type.as_str())
        .bind(r.cursor_ts)
        .bind(&r.page_marker)
        .bind(r.status as i16)
        .bind(r.consecutive_fail_count)
        .bind(r.total_synced_count)
        .bind(&r.last_error)
        .bind(r.last_synced_at)
        .bind(r.updated_at)
        .bind(r.window_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_sync_records(
        &self,
        sync_type: SyncType,
        status: SyncStatus,
    ) -> LedgerResult<Vec<SyncRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM shop_sync_records WHERE sync_type = $1 AND status = $2 ORDER BY shop_id",
        )
        .bind(sync_type.as_str())
        .bind(status as i16)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_record_from_row).collect()
    }
}

const UPDATE_WITHDRAW_STATUS: &str = r#"UPDATE withdraw_applications
               SET status = $3, auditor_id = $4,
                   audit_remark = COALESCE($5, audit_remark),
                   settle_tx_no = COALESCE($6, settle_tx_no),
                   updated_at = NOW()
               WHERE id = $1 AND status = $2"#;

const UPDATE_RECHARGE_STATUS: &str = r#"UPDATE recharge_applications
               SET status = $3, auditor_id = $4,
                   audit_remark = COALESCE($5, audit_remark),
                   tx_no = COALESCE($6, tx_no),
                   updated_at = NOW()
               WHERE id = $1 AND status = $2"#;

#[async_trait]
impl WorkflowStore for PgStore {
    async fn commit_funds(
        &self,
        posting: &Posting,
        change: FundsChange<'_>,
    ) -> LedgerResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let id = match change {
            FundsChange::OpenWithdraw(a) => {
                let row = sqlx::query(
                    r#"INSERT INTO withdraw_applications (principal_id, kind, amount,
                           collection_account_id, status, freeze_tx_no, remark, created_at, updated_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING id"#,
                )
                .bind(a.principal_id)
                .bind(a.kind.id())
                .bind(a.amount)
                .bind(a.collection_account_id)
                .bind(a.status.id())
                .bind(&posting.entry.tx_no)
                .bind(&a.remark)
                .bind(a.created_at)
                .fetch_one(&mut *tx)
                .await?;
                row.try_get::<i64, _>("id")?
            }
            FundsChange::Withdraw { id, from, to, stamp } => {
                let result = sqlx::query(UPDATE_WITHDRAW_STATUS)
                    .bind(id)
                    .bind(from.id())
                    .bind(to.id())
                    .bind(stamp.auditor_id)
                    .bind(&stamp.remark)
                    .bind(&stamp.tx_no)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() != 1 {
                    tx.rollback().await?;
                    return Ok(None);
                }
                id
            }
            FundsChange::Recharge { id, from, to, stamp } => {
                let result = sqlx::query(UPDATE_RECHARGE_STATUS)
                    .bind(id)
                    .bind(from.id())
                    .bind(to.id())
                    .bind(stamp.auditor_id)
                    .bind(&stamp.remark)
                    .bind(&stamp.tx_no)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() != 1 {
                    tx.rollback().await?;
                    return Ok(None);
                }
                id
            }
        };
        Self::apply_posting_tx(&mut tx, posting).await?;
        tx.commit().await?;
        Ok(Some(id))
    }

    async fn get_withdraw(&self, id: i64) -> LedgerResult<Option<WithdrawApplication>> {
        let row = sqlx::query("SELECT * FROM withdraw_applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(withdraw_from_row).transpose()
    }

    async fn transition_withdraw(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(UPDATE_WITHDRAW_STATUS)
        .bind(id)
        .bind(from.id())
        .bind(to.id())
        .bind(stamp.auditor_id)
        .bind(&stamp.remark)
        .bind(&stamp.tx_no)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_withdraws(
        &self,
        status: Option<WithdrawStatus>,
        limit: usize,
    ) -> LedgerResult<Vec<WithdrawApplication>> {
        let rows = sqlx::query(
            r#"SELECT * FROM withdraw_applications
               WHERE ($1::SMALLINT IS NULL OR status = $1)
               ORDER BY id DESC LIMIT $2"#,
        )
        .bind(status.map(|s| s.id()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(withdraw_from_row).collect()
    }

    async fn insert_recharge(&self, a: &RechargeApplication) -> LedgerResult<i64> {
        let row = sqlx::query(
            r#"INSERT INTO recharge_applications (principal_id, kind, amount, proof, status,
                   created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $6) RETURNING id"#,
        )
        .bind(a.principal_id)
        .bind(a.kind.id())
        .bind(a.amount)
        .bind(&a.proof)
        .bind(a.status.id())
        .bind(a.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_recharge(&self, id: i64) -> LedgerResult<Option<RechargeApplication>> {
        let row = sqlx::query("SELECT * FROM recharge_applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(recharge_from_row).transpose()
    }

    async fn transition_recharge(
        &self,
        id: i64,
        from: RechargeStatus,
        to: RechargeStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(UPDATE_RECHARGE_STATUS)
        .bind(id)
        .bind(from.id())
        .bind(to.id())
        .bind(stamp.auditor_id)
        .bind(&stamp.remark)
        .bind(&stamp.tx_no)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn ping(&self) -> LedgerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventLogStore for PgStore {
    async fn insert_event_log(&self, e: &EventLogEntry) -> LedgerResult<i64> {
        let row = sqlx::query(
            r#"INSERT INTO event_logs (shop_id, code, order_sn, upstream_timestamp, outcome,
                   detail, raw, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id"#,
        )
        .bind(e.shop_id)
        .bind(e.code)
        .bind(&e.order_sn)
        .bind(e.upstream_timestamp)
        .bind(e.outcome.as_str())
        .bind(&e.detail)
        .bind(&e.raw)
        .bind(e.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn list_event_logs(
        &self,
        shop_id: Option<ShopId>,
        limit: usize,
    ) -> LedgerResult<Vec<EventLogEntry>> {
        let rows = sqlx::query(
            r#"SELECT * FROM event_logs
               WHERE ($1::BIGINT IS NULL OR shop_id = $1)
               ORDER BY id DESC LIMIT $2"#,
        )
        .bind(shop_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_log_from_row).collect()
    }
}
