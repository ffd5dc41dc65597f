//! PostgreSQL schema for the custody ledger
//!
//! Tables owned by the campaign system (balances, spends, waitlist,
//! participants, wallets) are created here too so a fresh database is
//! usable end to end; on a shared database the `IF NOT EXISTS` makes
//! this a no-op.

use sqlx::PgPool;

pub const CREATE_DEPOSIT_ADDRESSES: &str = r#"
CREATE TABLE IF NOT EXISTS deposit_addresses_tb (
    id                BIGSERIAL PRIMARY KEY,
    user_id           BIGINT NOT NULL,
    chain             TEXT NOT NULL,
    address           TEXT NOT NULL,
    derivation_index  INTEGER NOT NULL,
    cached_balance    NUMERIC,
    cached_balance_at TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (user_id, chain)
)"#;

pub const CREATE_DEPOSITS: &str = r#"
CREATE TABLE IF NOT EXISTS deposits_tb (
    id                 BIGSERIAL PRIMARY KEY,
    deposit_address_id BIGINT NOT NULL REFERENCES deposit_addresses_tb(id),
    user_id            BIGINT NOT NULL,
    chain              TEXT NOT NULL,
    asset              TEXT NOT NULL,
    amount             NUMERIC NOT NULL,
    amount_usd         NUMERIC,
    tx_hash            TEXT NOT NULL UNIQUE,
    block_number       BIGINT,
    block_hash         TEXT,
    confirmations      INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    sweep_batch_id     BIGINT,
    sweep_tx_hash      TEXT,
    detected_at        TIMESTAMPTZ NOT NULL,
    confirmed_at       TIMESTAMPTZ,
    safe_at            TIMESTAMPTZ,
    swept_at           TIMESTAMPTZ
)"#;

pub const CREATE_DEPOSITS_STATUS_IDX: &str =
    "CREATE INDEX IF NOT EXISTS deposits_status_idx ON deposits_tb (chain, status)";

pub const CREATE_SWEEP_BATCHES: &str = r#"
CREATE TABLE IF NOT EXISTS sweep_batches_tb (
    id            BIGSERIAL PRIMARY KEY,
    chain         TEXT NOT NULL,
    status        TEXT NOT NULL,
    deposit_count INTEGER NOT NULL,
    total_amount  NUMERIC NOT NULL,
    total_usd     NUMERIC NOT NULL,
    tx_hash       TEXT,
    gas_cost      NUMERIC,
    created_at    TIMESTAMPTZ NOT NULL,
    executed_at   TIMESTAMPTZ
)"#;

pub const CREATE_REORG_INCIDENTS: &str = r#"
CREATE TABLE IF NOT EXISTS reorg_incidents_tb (
    id          BIGSERIAL PRIMARY KEY,
    deposit_id  BIGINT NOT NULL REFERENCES deposits_tb(id),
    user_id     BIGINT NOT NULL,
    amount      NUMERIC NOT NULL,
    status      TEXT NOT NULL,
    reason      TEXT NOT NULL,
    detected_at TIMESTAMPTZ NOT NULL
)"#;

pub const CREATE_VAULTS: &str = r#"
CREATE TABLE IF NOT EXISTS vault_addresses_tb (
    chain   TEXT PRIMARY KEY,
    address TEXT NOT NULL
)"#;

pub const CREATE_USER_BALANCES: &str = r#"
CREATE TABLE IF NOT EXISTS user_balances_tb (
    user_id    BIGINT PRIMARY KEY,
    balance    NUMERIC NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const CREATE_USER_SPENDS: &str = r#"
CREATE TABLE IF NOT EXISTS user_spends_tb (
    id         BIGSERIAL PRIMARY KEY,
    user_id    BIGINT NOT NULL,
    amount     NUMERIC NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

pub const CREATE_WAITLIST: &str = r#"
CREATE TABLE IF NOT EXISTS waitlist_entries_tb (
    id            BIGSERIAL PRIMARY KEY,
    user_id       BIGINT NOT NULL,
    campaign_id   BIGINT NOT NULL,
    is_open       BOOLEAN NOT NULL DEFAULT TRUE,
    has_deposited BOOLEAN NOT NULL DEFAULT FALSE,
    deposited_usd NUMERIC NOT NULL DEFAULT 0
)"#;

pub const CREATE_PARTICIPANTS: &str = r#"
CREATE TABLE IF NOT EXISTS trench_participants_tb (
    id                 BIGSERIAL PRIMARY KEY,
    user_id            BIGINT NOT NULL,
    trench_id          BIGINT NOT NULL,
    payout_usd         NUMERIC NOT NULL,
    expected_payout_at TIMESTAMPTZ NOT NULL,
    payout_error       TEXT,
    payout_error_at    TIMESTAMPTZ
)"#;

pub const CREATE_USER_WALLETS: &str = r#"
CREATE TABLE IF NOT EXISTS user_wallets_tb (
    user_id     BIGINT NOT NULL,
    wallet_type TEXT NOT NULL,
    family      TEXT NOT NULL,
    address     TEXT NOT NULL,
    PRIMARY KEY (user_id, wallet_type, family)
)"#;

pub const CREATE_SETTLEMENT_CONFIGS: &str = r#"
CREATE TABLE IF NOT EXISTS settlement_configs_tb (
    id            BIGSERIAL PRIMARY KEY,
    token_symbol  TEXT NOT NULL,
    token_address TEXT NOT NULL,
    chain         TEXT NOT NULL,
    paused        BOOLEAN NOT NULL DEFAULT FALSE,
    is_active     BOOLEAN NOT NULL DEFAULT TRUE
)"#;

pub const CREATE_PAYOUTS: &str = r#"
CREATE TABLE IF NOT EXISTS payouts_tb (
    id             BIGSERIAL PRIMARY KEY,
    participant_id BIGINT NOT NULL UNIQUE,
    user_id        BIGINT NOT NULL,
    trench_id      BIGINT NOT NULL,
    amount         NUMERIC NOT NULL,
    amount_usd     NUMERIC NOT NULL,
    to_address     TEXT NOT NULL,
    token_address  TEXT NOT NULL,
    chain          TEXT NOT NULL,
    status         TEXT NOT NULL,
    tx_hash        TEXT,
    error          TEXT,
    created_at     TIMESTAMPTZ NOT NULL,
    claimed_at     TIMESTAMPTZ,
    executed_at    TIMESTAMPTZ
)"#;

/// Tables created before payout claims were timestamped
pub const ADD_PAYOUTS_CLAIMED_AT: &str =
    "ALTER TABLE payouts_tb ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ";

pub const CREATE_PAYOUTS_EXECUTING_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS payouts_executing_idx
    ON payouts_tb (claimed_at) WHERE status = 'EXECUTING'"#;

const STATEMENTS: &[(&str, &str)] = &[
    ("deposit_addresses_tb", CREATE_DEPOSIT_ADDRESSES),
    ("deposits_tb", CREATE_DEPOSITS),
    ("deposits_status_idx", CREATE_DEPOSITS_STATUS_IDX),
    ("sweep_batches_tb", CREATE_SWEEP_BATCHES),
    ("reorg_incidents_tb", CREATE_REORG_INCIDENTS),
    ("vault_addresses_tb", CREATE_VAULTS),
    ("user_balances_tb", CREATE_USER_BALANCES),
    ("user_spends_tb", CREATE_USER_SPENDS),
    ("waitlist_entries_tb", CREATE_WAITLIST),
    ("trench_participants_tb", CREATE_PARTICIPANTS),
    ("user_wallets_tb", CREATE_USER_WALLETS),
    ("settlement_configs_tb", CREATE_SETTLEMENT_CONFIGS),
    ("payouts_tb", CREATE_PAYOUTS),
    ("payouts_tb.claimed_at", ADD_PAYOUTS_CLAIMED_AT),
    ("payouts_executing_idx", CREATE_PAYOUTS_EXECUTING_IDX),
];

/// Create every custody table that does not exist yet
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Ensuring custody schema...");
    for (name, sql) in STATEMENTS {
        sqlx::query(sql).execute(pool).await.inspect_err(|e| {
            tracing::error!(table = %name, error = %e, "Failed to create table");
        })?;
    }
    tracing::info!("Custody schema ready ({} statements)", STATEMENTS.len());
    Ok(())
}
