//! Idempotent schema bootstrap
//!
//! Every statement is `IF NOT EXISTS`, so running this at each start-up is
//! safe. Sharded tables are created once per partition.

use anyhow::Context;
use sqlx::PgPool;

use crate::shard::{SHARD_COUNT, table_name};

const GLOBAL_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS principals (
        id          BIGINT PRIMARY KEY,
        role        SMALLINT NOT NULL,
        username    VARCHAR(128) NOT NULL UNIQUE,
        status      SMALLINT NOT NULL DEFAULT 1,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS collection_accounts (
        id           BIGSERIAL PRIMARY KEY,
        principal_id BIGINT NOT NULL,
        channel      VARCHAR(32) NOT NULL,
        account_no   VARCHAR(128) NOT NULL,
        holder_name  VARCHAR(128) NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS accounts (
        kind          SMALLINT NOT NULL,
        principal_id  BIGINT NOT NULL,
        balance       NUMERIC(20,4) NOT NULL DEFAULT 0,
        frozen        NUMERIC(20,4) NOT NULL DEFAULT 0,
        total_in      NUMERIC(20,4) NOT NULL DEFAULT 0,
        total_out     NUMERIC(20,4) NOT NULL DEFAULT 0,
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (kind, principal_id),
        CONSTRAINT accounts_frozen_non_negative CHECK (frozen >= 0)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS journal_tx_nos (
        tx_no       VARCHAR(64) PRIMARY KEY,
        shard       SMALLINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS shops (
        shop_id          BIGINT PRIMARY KEY,
        owner_id         BIGINT,
        status           SMALLINT NOT NULL DEFAULT 0,
        access_token     TEXT,
        refresh_token    TEXT,
        token_expire_at  TIMESTAMPTZ,
        region           VARCHAR(16) NOT NULL DEFAULT '',
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cooperations (
        id           BIGSERIAL PRIMARY KEY,
        shop_id      BIGINT NOT NULL,
        operator_id  BIGINT NOT NULL,
        status       SMALLINT NOT NULL DEFAULT 1,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS cooperations_one_active
        ON cooperations (shop_id) WHERE status = 1"#,
    r#"CREATE TABLE IF NOT EXISTS profit_share_configs (
        shop_id          BIGINT NOT NULL,
        operator_id      BIGINT NOT NULL,
        platform_rate    NUMERIC(5,2) NOT NULL,
        operator_rate    NUMERIC(5,2) NOT NULL,
        shop_owner_rate  NUMERIC(5,2) NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (shop_id, operator_id),
        CONSTRAINT profit_share_sum CHECK (platform_rate + operator_rate + shop_owner_rate = 100)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS shop_sync_records (
        shop_id                 BIGINT NOT NULL,
        sync_type               VARCHAR(32) NOT NULL,
        cursor_ts               BIGINT NOT NULL DEFAULT 0,
        page_marker             TEXT,
        window_end              BIGINT,
        status                  SMALLINT NOT NULL DEFAULT 1,
        consecutive_fail_count  INT NOT NULL DEFAULT 0,
        total_synced_count      BIGINT NOT NULL DEFAULT 0,
        last_error              TEXT,
        last_synced_at          TIMESTAMPTZ,
        updated_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (shop_id, sync_type),
        CONSTRAINT paused_implies_threshold CHECK (status <> 2 OR consecutive_fail_count >= 10)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS withdraw_applications (
        id                     BIGSERIAL PRIMARY KEY,
        principal_id           BIGINT NOT NULL,
        kind                   SMALLINT NOT NULL,
        amount                 NUMERIC(20,4) NOT NULL CHECK (amount > 0),
        collection_account_id  BIGINT NOT NULL,
        status                 SMALLINT NOT NULL DEFAULT 0,
        freeze_tx_no           VARCHAR(64) NOT NULL,
        settle_tx_no           VARCHAR(64),
        auditor_id             BIGINT,
        remark                 TEXT NOT NULL DEFAULT '',
        audit_remark           TEXT,
        created_at             TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at             TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS recharge_applications (
        id            BIGSERIAL PRIMARY KEY,
        principal_id  BIGINT NOT NULL,
        kind          SMALLINT NOT NULL,
        amount        NUMERIC(20,4) NOT NULL CHECK (amount > 0),
        proof         TEXT NOT NULL DEFAULT '',
        status        SMALLINT NOT NULL DEFAULT 0,
        tx_no         VARCHAR(64),
        auditor_id    BIGINT,
        audit_remark  TEXT,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS event_logs (
        id                  BIGSERIAL PRIMARY KEY,
        shop_id             BIGINT NOT NULL,
        code                INT NOT NULL,
        order_sn            VARCHAR(64),
        upstream_timestamp  BIGINT NOT NULL,
        outcome             VARCHAR(16) NOT NULL,
        detail              TEXT,
        raw                 TEXT NOT NULL,
        created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS coord_kv (
        key         VARCHAR(255) PRIMARY KEY,
        token       VARCHAR(128) NOT NULL,
        expires_at  TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS coord_counters (
        key    VARCHAR(255) PRIMARY KEY,
        value  BIGINT NOT NULL
    )"#,
    "CREATE SEQUENCE IF NOT EXISTS order_shipment_id_seq",
    "ALTER TABLE shop_sync_records ADD COLUMN IF NOT EXISTS window_end BIGINT",
];

fn shard_tables(idx: usize) -> Vec<String> {
    let journal = table_name("account_transactions", idx);
    let orders = table_name("orders", idx);
    let shipments = table_name("order_shipment_records", idx);
    let escrows = table_name("order_escrows", idx);
    let settlements = table_name("order_settlements", idx);
    let wallet = table_name("shop_wallet_transactions", idx);

    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {journal} (
                id              BIGSERIAL PRIMARY KEY,
                tx_no           VARCHAR(64) NOT NULL UNIQUE,
                kind            SMALLINT NOT NULL,
                principal_id    BIGINT NOT NULL,
                tx_type         SMALLINT NOT NULL,
                amount          NUMERIC(20,4) NOT NULL,
                frozen_delta    NUMERIC(20,4) NOT NULL DEFAULT 0,
                balance_before  NUMERIC(20,4) NOT NULL,
                balance_after   NUMERIC(20,4) NOT NULL,
                remark          TEXT NOT NULL DEFAULT '',
                audit_status    SMALLINT NOT NULL DEFAULT 1,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT {journal}_balance_chain CHECK (balance_before + amount = balance_after)
            )"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {journal}_account_idx ON {journal} (principal_id, kind, created_at DESC)"
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {orders} (
                shop_id               BIGINT NOT NULL,
                order_sn              VARCHAR(64) NOT NULL,
                status                VARCHAR(32) NOT NULL,
                local_status_lock     VARCHAR(32),
                total_amount          NUMERIC(20,4) NOT NULL DEFAULT 0,
                currency              VARCHAR(8) NOT NULL DEFAULT '',
                upstream_update_time  BIGINT NOT NULL DEFAULT 0,
                first_seen_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_synced_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (shop_id, order_sn)
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {shipments} (
                id             BIGINT PRIMARY KEY DEFAULT nextval('order_shipment_id_seq'),
                shop_id        BIGINT NOT NULL,
                order_sn       VARCHAR(64) NOT NULL,
                operator_id    BIGINT,
                goods_cost     NUMERIC(20,4) NOT NULL DEFAULT 0,
                shipping_cost  NUMERIC(20,4) NOT NULL DEFAULT 0,
                tracking_no    VARCHAR(64) NOT NULL DEFAULT '',
                self_funded    BOOLEAN NOT NULL DEFAULT FALSE,
                status         SMALLINT NOT NULL DEFAULT 1,
                created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {shipments}_order_idx ON {shipments} (shop_id, order_sn, id DESC)"
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {escrows} (
                shop_id                BIGINT NOT NULL,
                order_sn               VARCHAR(64) NOT NULL,
                seller_receive_amount  NUMERIC(20,4) NOT NULL,
                commission_fee         NUMERIC(20,4) NOT NULL DEFAULT 0,
                service_fee            NUMERIC(20,4) NOT NULL DEFAULT 0,
                raw                    TEXT NOT NULL DEFAULT '{{}}',
                synced_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (shop_id, order_sn)
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {settlements} (
                shop_id           BIGINT NOT NULL,
                order_sn          VARCHAR(64) NOT NULL,
                operator_id       BIGINT,
                shop_owner_id     BIGINT,
                gross             NUMERIC(20,4) NOT NULL DEFAULT 0,
                cost              NUMERIC(20,4) NOT NULL DEFAULT 0,
                net               NUMERIC(20,4) NOT NULL DEFAULT 0,
                platform_share    NUMERIC(20,4) NOT NULL DEFAULT 0,
                operator_share    NUMERIC(20,4) NOT NULL DEFAULT 0,
                shop_owner_share  NUMERIC(20,4) NOT NULL DEFAULT 0,
                status            SMALLINT NOT NULL DEFAULT 0,
                journal_posted    BOOLEAN NOT NULL DEFAULT FALSE,
                needs_adjustment  BOOLEAN NOT NULL DEFAULT FALSE,
                last_error        TEXT,
                created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (shop_id, order_sn),
                CONSTRAINT {settlements}_shares_sum
                    CHECK (status <> 1 OR platform_share + operator_share + shop_owner_share = net)
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {wallet} (
                shop_id           BIGINT NOT NULL,
                transaction_id    BIGINT NOT NULL,
                order_sn          VARCHAR(64),
                transaction_type  VARCHAR(64) NOT NULL,
                amount            NUMERIC(20,4) NOT NULL,
                create_time       BIGINT NOT NULL,
                synced_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (shop_id, transaction_id)
            )"#
        ),
    ]
}

/// Create every table, index and sequence the ledger uses
pub async fn init_schema(pool: &PgPool) -> anyhow::Result<()> {
    for ddl in GLOBAL_TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("schema statement failed: {}", first_line(ddl)))?;
    }
    for idx in 0..SHARD_COUNT {
        for ddl in shard_tables(idx) {
            sqlx::query(&ddl)
                .execute(pool)
                .await
                .with_context(|| format!("shard {} statement failed: {}", idx, first_line(&ddl)))?;
        }
    }
    tracing::info!(shards = SHARD_COUNT, "Schema initialised");
    Ok(())
}

fn first_line(sql: &str) -> &str {
    sql.lines().next().unwrap_or(sql).trim()
}
