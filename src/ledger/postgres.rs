//! PostgreSQL ledger
//!
//! Runtime-checked queries (`sqlx::query`), one transaction per atomic
//! operation. Row locks (`FOR UPDATE`) serialize concurrent crediting,
//! reversal and claiming of the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

use super::models::*;
use super::{
    AddressStore, DepositStore, LedgerError, LedgerResult, SettlementStore, SweepStore,
};
use crate::core_types::{
    Chain, ChainFamily, DepositAddressId, DepositId, DerivationIndex, ParticipantId, PayoutId,
    SweepBatchId, UserId,
};

const DEPOSIT_COLUMNS: &str = "id, deposit_address_id, user_id, chain, asset, amount, amount_usd, \
     tx_hash, block_number, block_hash, confirmations, status, sweep_batch_id, sweep_tx_hash, \
     detected_at, confirmed_at, safe_at, swept_at";

const ADDRESS_COLUMNS: &str = "id, user_id, chain, address, derivation_index, cached_balance, \
     cached_balance_at, created_at";

const BATCH_COLUMNS: &str = "id, chain, status, deposit_count, total_amount, total_usd, tx_hash, \
     gas_cost, created_at, executed_at";

const PAYOUT_COLUMNS: &str = "id, participant_id, user_id, trench_id, amount, amount_usd, \
     to_address, token_address, chain, status, tx_hash, error, created_at, claimed_at, executed_at";

const INCIDENT_COLUMNS: &str = "id, deposit_id, user_id, amount, status, reason, detected_at";

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_chain(s: &str) -> LedgerResult<Chain> {
    s.parse().map_err(LedgerError::Decode)
}

fn decode_family(s: &str) -> LedgerResult<ChainFamily> {
    match s {
        "evm" => Ok(ChainFamily::Evm),
        "solana" => Ok(ChainFamily::Solana),
        other => Err(LedgerError::Decode(format!("unknown family '{}'", other))),
    }
}

fn decode_status<T>(s: &str, parse: fn(&str) -> Option<T>) -> LedgerResult<T> {
    parse(s).ok_or_else(|| LedgerError::Decode(format!("unknown status '{}'", s)))
}

fn decode_u32(v: i32, column: &str) -> LedgerResult<u32> {
    u32::try_from(v).map_err(|_| LedgerError::Decode(format!("negative {}: {}", column, v)))
}

fn row_to_address(row: &PgRow) -> LedgerResult<DepositAddress> {
    Ok(DepositAddress {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        chain: decode_chain(row.try_get("chain")?)?,
        address: row.try_get("address")?,
        derivation_index: decode_u32(row.try_get("derivation_index")?, "derivation_index")?,
        cached_balance: row.try_get("cached_balance")?,
        cached_balance_at: row.try_get("cached_balance_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_deposit(row: &PgRow) -> LedgerResult<Deposit> {
    let block_number: Option<i64> = row.try_get("block_number")?;
    Ok(Deposit {
        id: row.try_get("id")?,
        deposit_address_id: row.try_get("deposit_address_id")?,
        user_id: row.try_get("user_id")?,
        chain: decode_chain(row.try_get("chain")?)?,
        asset: row.try_get("asset")?,
        amount: row.try_get("amount")?,
        amount_usd: row.try_get("amount_usd")?,
        tx_hash: row.try_get("tx_hash")?,
        block_number: block_number.map(|n| n as u64),
        block_hash: row.try_get("block_hash")?,
        confirmations: decode_u32(row.try_get("confirmations")?, "confirmations")?,
        status: decode_status(row.try_get("status")?, DepositStatus::parse)?,
        sweep_batch_id: row.try_get("sweep_batch_id")?,
        sweep_tx_hash: row.try_get("sweep_tx_hash")?,
        detected_at: row.try_get("detected_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        safe_at: row.try_get("safe_at")?,
        swept_at: row.try_get("swept_at")?,
    })
}

fn row_to_batch(row: &PgRow) -> LedgerResult<SweepBatch> {
    Ok(SweepBatch {
        id: row.try_get("id")?,
        chain: decode_chain(row.try_get("chain")?)?,
        status: decode_status(row.try_get("status")?, SweepStatus::parse)?,
        deposit_count: decode_u32(row.try_get("deposit_count")?, "deposit_count")?,
        total_amount: row.try_get("total_amount")?,
        total_usd: row.try_get("total_usd")?,
        tx_hash: row.try_get("tx_hash")?,
        gas_cost: row.try_get("gas_cost")?,
        created_at: row.try_get("created_at")?,
        executed_at: row.try_get("executed_at")?,
    })
}

fn row_to_incident(row: &PgRow) -> LedgerResult<ReorgIncident> {
    Ok(ReorgIncident {
        id: row.try_get("id")?,
        deposit_id: row.try_get("deposit_id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        status: decode_status(row.try_get("status")?, IncidentStatus::parse)?,
        reason: row.try_get("reason")?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn row_to_payout(row: &PgRow) -> LedgerResult<Payout> {
    Ok(Payout {
        id: row.try_get("id")?,
        participant_id: row.try_get("participant_id")?,
        user_id: row.try_get("user_id")?,
        trench_id: row.try_get("trench_id")?,
        amount: row.try_get("amount")?,
        amount_usd: row.try_get("amount_usd")?,
        to_address: row.try_get("to_address")?,
        token_address: row.try_get("token_address")?,
        chain: decode_chain(row.try_get("chain")?)?,
        status: decode_status(row.try_get("status")?, PayoutStatus::parse)?,
        tx_hash: row.try_get("tx_hash")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        claimed_at: row.try_get("claimed_at")?,
        executed_at: row.try_get("executed_at")?,
    })
}

fn row_to_participant(row: &PgRow) -> LedgerResult<Participant> {
    Ok(Participant {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        trench_id: row.try_get("trench_id")?,
        payout_usd: row.try_get("payout_usd")?,
        expected_payout_at: row.try_get("expected_payout_at")?,
    })
}

fn row_to_wallet(row: &PgRow) -> LedgerResult<UserWallet> {
    Ok(UserWallet {
        user_id: row.try_get("user_id")?,
        wallet_type: row.try_get("wallet_type")?,
        family: decode_family(row.try_get("family")?)?,
        address: row.try_get("address")?,
    })
}

fn row_to_settlement_config(row: &PgRow) -> LedgerResult<SettlementConfig> {
    Ok(SettlementConfig {
        token_symbol: row.try_get("token_symbol")?,
        token_address: row.try_get("token_address")?,
        chain: decode_chain(row.try_get("chain")?)?,
        paused: row.try_get("paused")?,
    })
}

fn statuses(list: &[DepositStatus]) -> Vec<String> {
    list.iter().map(|s| s.as_str().to_string()).collect()
}

async fn insert_incident<'c, E>(executor: E, new: &NewIncident) -> LedgerResult<ReorgIncident>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row = sqlx::query(&format!(
        "INSERT INTO reorg_incidents_tb (deposit_id, user_id, amount, status, reason, detected_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING {}",
        INCIDENT_COLUMNS
    ))
    .bind(new.deposit_id)
    .bind(new.user_id)
    .bind(new.amount)
    .bind(new.status.as_str())
    .bind(&new.reason)
    .bind(new.detected_at)
    .fetch_one(executor)
    .await?;
    row_to_incident(&row)
}

#[async_trait]
impl AddressStore for PgLedger {
    async fn find_deposit_address(
        &self,
        user_id: UserId,
        chain: Chain,
    ) -> LedgerResult<Option<DepositAddress>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deposit_addresses_tb WHERE user_id = $1 AND chain = $2",
            ADDRESS_COLUMNS
        ))
        .bind(user_id)
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_address).transpose()
    }

    async fn deposit_address_by_id(
        &self,
        id: DepositAddressId,
    ) -> LedgerResult<Option<DepositAddress>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deposit_addresses_tb WHERE id = $1",
            ADDRESS_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_address).transpose()
    }

    async fn user_addresses(&self, user_id: UserId) -> LedgerResult<Vec<DepositAddress>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deposit_addresses_tb WHERE user_id = $1 ORDER BY created_at, id",
            ADDRESS_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_address).collect()
    }

    async fn max_derivation_index(
        &self,
        family: ChainFamily,
    ) -> LedgerResult<Option<DerivationIndex>> {
        let chains: Vec<&str> = Chain::ALL
            .iter()
            .filter(|c| c.family() == family)
            .map(|c| c.as_str())
            .collect();
        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(derivation_index) FROM deposit_addresses_tb WHERE chain = ANY($1)",
        )
        .bind(&chains)
        .fetch_one(&self.pool)
        .await?;
        max.map(|v| decode_u32(v, "derivation_index")).transpose()
    }

    async fn insert_deposit_address(
        &self,
        new: NewDepositAddress,
        now: DateTime<Utc>,
    ) -> LedgerResult<DepositAddress> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO deposit_addresses_tb (user_id, chain, address, derivation_index, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, chain) DO NOTHING
             RETURNING {}",
            ADDRESS_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.chain.as_str())
        .bind(&new.address)
        .bind(new.derivation_index as i32)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => row_to_address(&row),
            None => self
                .find_deposit_address(new.user_id, new.chain)
                .await?
                .ok_or_else(|| {
                    LedgerError::Invariant(format!(
                        "address conflict for user {} on {} but no row",
                        new.user_id, new.chain
                    ))
                }),
        }
    }

    async fn repoint_deposit_address(
        &self,
        id: DepositAddressId,
        address: &str,
        derivation_index: DerivationIndex,
    ) -> LedgerResult<()> {
        let res = sqlx::query(
            "UPDATE deposit_addresses_tb SET address = $1, derivation_index = $2 WHERE id = $3",
        )
        .bind(address)
        .bind(derivation_index as i32)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("deposit address {}", id)));
        }
        Ok(())
    }

    async fn watched_addresses(&self, chain: Chain) -> LedgerResult<Vec<DepositAddress>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deposit_addresses_tb WHERE chain = $1 ORDER BY id",
            ADDRESS_COLUMNS
        ))
        .bind(chain.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_address).collect()
    }

    async fn update_cached_balance(
        &self,
        id: DepositAddressId,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE deposit_addresses_tb SET cached_balance = $1, cached_balance_at = $2 WHERE id = $3",
        )
        .bind(balance)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DepositStore for PgLedger {
    async fn insert_deposit(&self, new: NewDeposit) -> LedgerResult<Option<Deposit>> {
        let row = sqlx::query(&format!(
            "INSERT INTO deposits_tb (deposit_address_id, user_id, chain, asset, amount, amount_usd,
                 tx_hash, block_number, block_hash, confirmations, status, detected_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (tx_hash) DO NOTHING
             RETURNING {}",
            DEPOSIT_COLUMNS
        ))
        .bind(new.deposit_address_id)
        .bind(new.user_id)
        .bind(new.chain.as_str())
        .bind(&new.asset)
        .bind(new.amount)
        .bind(new.amount_usd)
        .bind(&new.tx_hash)
        .bind(new.block_number.map(|n| n as i64))
        .bind(&new.block_hash)
        .bind(new.confirmations as i32)
        .bind(DepositStatus::for_confirmations(new.confirmations).as_str())
        .bind(new.detected_at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn deposit(&self, id: DepositId) -> LedgerResult<Option<Deposit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb WHERE id = $1",
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn deposit_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<Deposit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb WHERE tx_hash = $1",
            DEPOSIT_COLUMNS
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn latest_deposit_block(&self, chain: Chain) -> LedgerResult<Option<u64>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_number) FROM deposits_tb WHERE chain = $1")
                .bind(chain.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(|n| n as u64))
    }

    async fn deposits_in_status(
        &self,
        chain: Option<Chain>,
        list: &[DepositStatus],
    ) -> LedgerResult<Vec<Deposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb
             WHERE status = ANY($1) AND ($2::TEXT IS NULL OR chain = $2)
             ORDER BY id",
            DEPOSIT_COLUMNS
        ))
        .bind(statuses(list))
        .bind(chain.map(|c| c.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_deposit).collect()
    }

    async fn update_confirmations(&self, id: DepositId, confirmations: u32) -> LedgerResult<bool> {
        let res = sqlx::query(
            "UPDATE deposits_tb
             SET confirmations = GREATEST(confirmations, $1),
                 status = CASE WHEN GREATEST(confirmations, $1) > 0 THEN 'CONFIRMING' ELSE 'PENDING' END
             WHERE id = $2 AND status = ANY($3)",
        )
        .bind(confirmations as i32)
        .bind(id)
        .bind(statuses(&DepositStatus::PRE_CREDIT))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_deposit_usd(&self, id: DepositId, amount_usd: Decimal) -> LedgerResult<()> {
        sqlx::query("UPDATE deposits_tb SET amount_usd = $1 WHERE id = $2")
            .bind(amount_usd)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn credit_deposit(
        &self,
        id: DepositId,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE deposits_tb
             SET status = 'CONFIRMED', confirmations = GREATEST(confirmations, $1),
                 confirmed_at = $2, safe_at = $2
             WHERE id = $3 AND status = ANY($4) AND amount_usd IS NOT NULL
             RETURNING user_id, amount_usd",
        )
        .bind(confirmations as i32)
        .bind(now)
        .bind(id)
        .bind(statuses(&DepositStatus::PRE_CREDIT))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let user_id: UserId = row.try_get("user_id")?;
        let usd: Decimal = row.try_get("amount_usd")?;

        sqlx::query(
            "INSERT INTO user_balances_tb (user_id, balance, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (user_id)
             DO UPDATE SET balance = user_balances_tb.balance + EXCLUDED.balance, updated_at = $3",
        )
        .bind(user_id)
        .bind(usd)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE waitlist_entries_tb
             SET has_deposited = TRUE, deposited_usd = deposited_usd + $1
             WHERE user_id = $2 AND is_open AND NOT has_deposited",
        )
        .bind(usd)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_reorged_before_credit(
        &self,
        id: DepositId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<ReorgIncident>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE deposits_tb SET status = 'REORGED'
             WHERE id = $1 AND status = ANY($2)
             RETURNING user_id, amount_usd",
        )
        .bind(id)
        .bind(statuses(&DepositStatus::PRE_CREDIT))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let usd: Option<Decimal> = row.try_get("amount_usd")?;
        let incident = insert_incident(
            &mut *tx,
            &NewIncident {
                deposit_id: id,
                user_id: row.try_get("user_id")?,
                amount: usd.unwrap_or(Decimal::ZERO),
                status: IncidentStatus::DetectedBeforeCredit,
                reason: reason.to_string(),
                detected_at: now,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(Some(incident))
    }

    async fn credited_deposits_since(&self, since: DateTime<Utc>) -> LedgerResult<Vec<Deposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb WHERE status = ANY($1) AND safe_at >= $2 ORDER BY id",
            DEPOSIT_COLUMNS
        ))
        .bind(statuses(&DepositStatus::CREDITED))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_deposit).collect()
    }

    async fn reverse_credited_deposit(
        &self,
        id: DepositId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReversalOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb WHERE id = $1 FOR UPDATE",
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", id)))?;
        let deposit = row_to_deposit(&row)?;
        if deposit.status != DepositStatus::Confirmed {
            return Ok(ReversalOutcome::NotReversible(deposit.status));
        }
        if let Some(batch_id) = deposit.sweep_batch_id {
            return Ok(ReversalOutcome::LinkedToSweep(batch_id));
        }
        let amount = deposit.amount_usd.unwrap_or(Decimal::ZERO);

        let balance: Option<Decimal> = sqlx::query_scalar(
            "SELECT balance FROM user_balances_tb WHERE user_id = $1 FOR UPDATE",
        )
        .bind(deposit.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let balance = balance.unwrap_or(Decimal::ZERO);
        if balance < amount {
            return Ok(ReversalOutcome::InsufficientBalance { balance });
        }

        sqlx::query(
            "UPDATE user_balances_tb SET balance = balance - $1, updated_at = $2 WHERE user_id = $3",
        )
        .bind(amount)
        .bind(now)
        .bind(deposit.user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE deposits_tb SET status = 'REORGED' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let incident = insert_incident(
            &mut *tx,
            &NewIncident {
                deposit_id: id,
                user_id: deposit.user_id,
                amount,
                status: IncidentStatus::Reversed,
                reason: reason.to_string(),
                detected_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(ReversalOutcome::Reversed(incident))
    }

    async fn record_incident(&self, incident: NewIncident) -> LedgerResult<ReorgIncident> {
        insert_incident(&self.pool, &incident).await
    }

    async fn incidents_for_deposit(&self, id: DepositId) -> LedgerResult<Vec<ReorgIncident>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reorg_incidents_tb WHERE deposit_id = $1 ORDER BY id",
            INCIDENT_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_incident).collect()
    }

    async fn user_balance(&self, user_id: UserId) -> LedgerResult<Decimal> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM user_balances_tb WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    async fn spends_since(&self, user_id: UserId, since: DateTime<Utc>) -> LedgerResult<Decimal> {
        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(amount) FROM user_spends_tb WHERE user_id = $1 AND created_at >= $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    async fn deposit_stats(&self) -> LedgerResult<DepositStats> {
        let rows = sqlx::query(
            "SELECT chain, status, COUNT(*) AS n,
                    COALESCE(SUM(amount_usd), 0) AS usd,
                    COUNT(*) FILTER (WHERE amount_usd IS NULL) AS unpriced
             FROM deposits_tb GROUP BY chain, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DepositStats::default();
        for row in &rows {
            let chain: String = row.try_get("chain")?;
            let status = decode_status(row.try_get("status")?, DepositStatus::parse)?;
            let n: i64 = row.try_get("n")?;
            let usd: Decimal = row.try_get("usd")?;
            let unpriced: i64 = row.try_get("unpriced")?;

            *stats
                .by_status
                .entry(status.as_str().to_string())
                .or_default() += n as u64;
            if status.is_credited() {
                stats.credited_usd += usd;
            }
            if status.is_pre_credit() {
                *stats.pending_by_chain.entry(chain).or_default() += n as u64;
            }
            stats.unpriced += unpriced as u64;
        }
        Ok(stats)
    }
}

#[async_trait]
impl SweepStore for PgLedger {
    async fn sweepable_deposits(&self, chain: Chain, limit: usize) -> LedgerResult<Vec<Deposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb
             WHERE chain = $1 AND status = 'CONFIRMED' AND sweep_batch_id IS NULL
             ORDER BY confirmed_at, id
             LIMIT $2",
            DEPOSIT_COLUMNS
        ))
        .bind(chain.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_deposit).collect()
    }

    async fn create_sweep_batch(
        &self,
        chain: Chain,
        candidates: &[DepositId],
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<(SweepBatch, Vec<Deposit>)>> {
        let mut tx = self.pool.begin().await?;

        let batch_id: SweepBatchId = sqlx::query_scalar(
            "INSERT INTO sweep_batches_tb (chain, status, deposit_count, total_amount, total_usd, created_at)
             VALUES ($1, 'PENDING', 0, 0, 0, $2)
             RETURNING id",
        )
        .bind(chain.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let rows = sqlx::query(&format!(
            "UPDATE deposits_tb SET sweep_batch_id = $1
             WHERE id = ANY($2) AND chain = $3 AND status = 'CONFIRMED' AND sweep_batch_id IS NULL
             RETURNING {}",
            DEPOSIT_COLUMNS
        ))
        .bind(batch_id)
        .bind(candidates)
        .bind(chain.as_str())
        .fetch_all(&mut *tx)
        .await?;
        let linked = rows
            .iter()
            .map(row_to_deposit)
            .collect::<LedgerResult<Vec<_>>>()?;

        if linked.is_empty() {
            tx.rollback().await?;
            return Ok(None);
        }

        let total_amount: Decimal = linked.iter().map(|d| d.amount).sum();
        let total_usd: Decimal = linked.iter().filter_map(|d| d.amount_usd).sum();
        let row = sqlx::query(&format!(
            "UPDATE sweep_batches_tb SET deposit_count = $1, total_amount = $2, total_usd = $3
             WHERE id = $4
             RETURNING {}",
            BATCH_COLUMNS
        ))
        .bind(linked.len() as i32)
        .bind(total_amount)
        .bind(total_usd)
        .bind(batch_id)
        .fetch_one(&mut *tx)
        .await?;
        let batch = row_to_batch(&row)?;

        tx.commit().await?;
        Ok(Some((batch, linked)))
    }

    async fn mark_deposit_swept(
        &self,
        id: DepositId,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE deposits_tb SET status = 'SWEPT', sweep_tx_hash = $1, swept_at = $2
             WHERE id = $3 AND status = 'CONFIRMED'",
        )
        .bind(tx_hash)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_sweep_batch(
        &self,
        id: SweepBatchId,
        status: SweepStatus,
        tx_hash: Option<String>,
        gas_cost: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let res = sqlx::query(
            "UPDATE sweep_batches_tb SET status = $1, tx_hash = $2, gas_cost = $3, executed_at = $4
             WHERE id = $5",
        )
        .bind(status.as_str())
        .bind(tx_hash)
        .bind(gas_cost)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("sweep batch {}", id)));
        }
        Ok(())
    }

    async fn sweep_batch(&self, id: SweepBatchId) -> LedgerResult<Option<SweepBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sweep_batches_tb WHERE id = $1",
            BATCH_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_batch).transpose()
    }

    async fn sweep_batches(
        &self,
        chain: Chain,
        status: SweepStatus,
    ) -> LedgerResult<Vec<SweepBatch>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sweep_batches_tb WHERE chain = $1 AND status = $2 ORDER BY id",
            BATCH_COLUMNS
        ))
        .bind(chain.as_str())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_batch).collect()
    }

    async fn batch_deposits(&self, id: SweepBatchId) -> LedgerResult<Vec<Deposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deposits_tb WHERE sweep_batch_id = $1 ORDER BY id",
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_deposit).collect()
    }

    async fn release_sweep_batch(&self, id: SweepBatchId) -> LedgerResult<u64> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM sweep_batches_tb WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            Some("FAILED") => {}
            Some(other) => {
                return Err(LedgerError::Invariant(format!(
                    "sweep batch {} is {}, only FAILED batches can be released",
                    id, other
                )));
            }
            None => return Err(LedgerError::NotFound(format!("sweep batch {}", id))),
        }

        let released = sqlx::query(
            "UPDATE deposits_tb SET sweep_batch_id = NULL
             WHERE sweep_batch_id = $1 AND status = 'CONFIRMED'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Swept or reorged rows keep no dangling reference
        sqlx::query("UPDATE deposits_tb SET sweep_batch_id = NULL WHERE sweep_batch_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sweep_batches_tb WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(released)
    }

    async fn release_unswept_deposits(&self, chain: Chain) -> LedgerResult<u64> {
        let res = sqlx::query(
            "UPDATE deposits_tb d SET sweep_batch_id = NULL
             FROM sweep_batches_tb b
             WHERE d.sweep_batch_id = b.id
               AND b.status = 'COMPLETED'
               AND b.chain = $1
               AND d.status = 'CONFIRMED'",
        )
        .bind(chain.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn vault_address(&self, chain: Chain) -> LedgerResult<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT address FROM vault_addresses_tb WHERE chain = $1")
                .bind(chain.as_str())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn sweep_stats(&self) -> LedgerResult<SweepStats> {
        let mut stats = SweepStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sweep_batches_tb GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.batches_by_status.insert(status, n as u64);
        }

        let row = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(SUM(amount_usd), 0) AS usd
             FROM deposits_tb WHERE status = 'SWEPT'",
        )
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        stats.swept_deposits = n as u64;
        stats.swept_usd = row.try_get("usd")?;

        let rows = sqlx::query(
            "SELECT chain, COUNT(*) AS n FROM deposits_tb
             WHERE status = 'CONFIRMED' AND sweep_batch_id IS NULL GROUP BY chain",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut eligible = BTreeMap::new();
        for row in &rows {
            let chain: String = row.try_get("chain")?;
            let n: i64 = row.try_get("n")?;
            eligible.insert(chain, n as u64);
        }
        stats.eligible_by_chain = eligible;
        Ok(stats)
    }
}

#[async_trait]
impl SettlementStore for PgLedger {
    async fn due_participants(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT p.id, p.user_id, p.trench_id, p.payout_usd, p.expected_payout_at
             FROM trench_participants_tb p
             WHERE p.expected_payout_at <= $1
               AND NOT EXISTS (SELECT 1 FROM payouts_tb po WHERE po.participant_id = p.id)
             ORDER BY p.payout_error_at NULLS FIRST, p.expected_payout_at, p.id
             LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_participant).collect()
    }

    async fn user_wallets(&self, user_id: UserId) -> LedgerResult<Vec<UserWallet>> {
        let rows = sqlx::query(
            "SELECT user_id, wallet_type, family, address FROM user_wallets_tb WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_wallet).collect()
    }

    async fn payout_exists(&self, participant_id: ParticipantId) -> LedgerResult<bool> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payouts_tb WHERE participant_id = $1)")
                .bind(participant_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn insert_payout(&self, new: NewPayout) -> LedgerResult<Option<Payout>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO payouts_tb (participant_id, user_id, trench_id, amount, amount_usd,
                 to_address, token_address, chain, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', $9)
             ON CONFLICT (participant_id) DO NOTHING
             RETURNING {}",
            PAYOUT_COLUMNS
        ))
        .bind(new.participant_id)
        .bind(new.user_id)
        .bind(new.trench_id)
        .bind(new.amount)
        .bind(new.amount_usd)
        .bind(&new.to_address)
        .bind(&new.token_address)
        .bind(new.chain.as_str())
        .bind(new.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        if row.is_some() {
            sqlx::query(
                "UPDATE trench_participants_tb SET payout_error = NULL, payout_error_at = NULL
                 WHERE id = $1",
            )
            .bind(new.participant_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        row.as_ref().map(row_to_payout).transpose()
    }

    async fn record_payout_error(
        &self,
        participant_id: ParticipantId,
        error: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE trench_participants_tb SET payout_error = $1, payout_error_at = $2 WHERE id = $3",
        )
        .bind(error)
        .bind(now)
        .bind(participant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn payout(&self, id: PayoutId) -> LedgerResult<Option<Payout>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payouts_tb WHERE id = $1",
            PAYOUT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_payout).transpose()
    }

    async fn pending_payouts(&self, limit: usize) -> LedgerResult<Vec<Payout>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payouts_tb WHERE status = 'PENDING' ORDER BY created_at, id LIMIT $1",
            PAYOUT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_payout).collect()
    }

    async fn claim_payout(&self, id: PayoutId, now: DateTime<Utc>) -> LedgerResult<bool> {
        let res = sqlx::query(
            "UPDATE payouts_tb SET status = 'EXECUTING', claimed_at = $2
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn release_payout(&self, id: PayoutId) -> LedgerResult<bool> {
        let res = sqlx::query(
            "UPDATE payouts_tb SET status = 'PENDING', claimed_at = NULL
             WHERE id = $1 AND status = 'EXECUTING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn stale_executing_payouts(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Payout>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payouts_tb
             WHERE status = 'EXECUTING' AND claimed_at < $1
             ORDER BY claimed_at, id LIMIT $2",
            PAYOUT_COLUMNS
        ))
        .bind(claimed_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_payout).collect()
    }

    async fn complete_payout(
        &self,
        id: PayoutId,
        status: PayoutStatus,
        tx_hash: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let res = sqlx::query(
            "UPDATE payouts_tb
             SET status = $1, tx_hash = COALESCE($2, tx_hash), error = $3, executed_at = $4
             WHERE id = $5",
        )
        .bind(status.as_str())
        .bind(tx_hash)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("payout {}", id)));
        }
        Ok(())
    }

    async fn active_settlement_config(&self) -> LedgerResult<Option<SettlementConfig>> {
        let row = sqlx::query(
            "SELECT token_symbol, token_address, chain, paused FROM settlement_configs_tb
             WHERE is_active ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_settlement_config).transpose()
    }

    async fn migrate_pending_payouts(
        &self,
        token_address: &str,
        chain: Chain,
    ) -> LedgerResult<u64> {
        let res = sqlx::query(
            "UPDATE payouts_tb SET token_address = $1, chain = $2 WHERE status = 'PENDING'",
        )
        .bind(token_address)
        .bind(chain.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_helpers() {
        assert_eq!(decode_chain("base").unwrap(), Chain::Base);
        assert!(decode_chain("dogecoin").is_err());
        assert_eq!(decode_family("solana").unwrap(), ChainFamily::Solana);
        assert!(decode_u32(-1, "confirmations").is_err());
        assert_eq!(
            decode_status("SWEPT", DepositStatus::parse).unwrap(),
            DepositStatus::Swept
        );
    }

    /// Requires a running PostgreSQL (DATABASE_URL)
    #[tokio::test]
    #[ignore]
    async fn test_pg_deposit_idempotent_and_credit() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = PgPool::connect(&url).await.unwrap();
        super::super::schema::ensure_schema(&pool).await.unwrap();
        let ledger = PgLedger::new(pool);

        let addr = ledger
            .insert_deposit_address(
                NewDepositAddress {
                    user_id: 9_000_001,
                    chain: Chain::Base,
                    address: "0x0000000000000000000000000000000000009001".to_string(),
                    derivation_index: 9001,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let tx_hash = format!("0xpgtest{}", uuid::Uuid::new_v4().simple());
        let new = NewDeposit {
            deposit_address_id: addr.id,
            user_id: addr.user_id,
            chain: Chain::Base,
            asset: "USDC".to_string(),
            amount: Decimal::new(25, 0),
            amount_usd: Some(Decimal::new(25, 0)),
            tx_hash: tx_hash.clone(),
            block_number: Some(1),
            block_hash: Some("0x01".to_string()),
            confirmations: 0,
            detected_at: Utc::now(),
        };
        let first = ledger.insert_deposit(new.clone()).await.unwrap().unwrap();
        assert!(ledger.insert_deposit(new).await.unwrap().is_none());

        assert!(ledger.credit_deposit(first.id, 12, Utc::now()).await.unwrap());
        assert!(!ledger.credit_deposit(first.id, 12, Utc::now()).await.unwrap());
    }
}
