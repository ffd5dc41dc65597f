//! Deposit pipeline
//!
//! Bridges chain scanning and the ledger:
//! 1. `record_detected` turns scanned transfers into PENDING/CONFIRMING
//!    deposit rows (dust filter, USD pricing, idempotent on tx hash)
//! 2. `credit` moves a deposit that reached its threshold to CONFIRMED and
//!    credits the user's balance in one ledger call

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{ChainAdapter, DetectedDeposit};
use crate::error::CustodyError;
use crate::ledger::{Deposit, DepositAddress, LedgerStore, NewDeposit};
use crate::oracle::PriceOracle;

/// What happened to one scanned transfer
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(Deposit),
    Dust,
    Duplicate,
    UnknownAddress,
}

/// Result of recording one scan
#[derive(Debug, Clone, Default)]
pub struct RecordedBatch {
    /// Deposits newly written
    pub deposits: Vec<Deposit>,
    /// Transfers that could not be written; the scanned range must be
    /// scanned again
    pub failed: usize,
}

pub struct DepositPipeline {
    adapter: Arc<dyn ChainAdapter>,
    ledger: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
}

impl DepositPipeline {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        ledger: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        Self {
            adapter,
            ledger,
            oracle,
        }
    }

    /// Record every scanned transfer. Per-item failures are logged, counted
    /// and do not stop the rest.
    pub async fn record_detected(
        &self,
        detected: &[DetectedDeposit],
        watched: &[DepositAddress],
        now: DateTime<Utc>,
    ) -> RecordedBatch {
        let chain = self.adapter.chain();
        let by_address: HashMap<String, &DepositAddress> = watched
            .iter()
            .map(|a| (address_key(chain.is_evm(), &a.address), a))
            .collect();

        let mut recorded = RecordedBatch::default();
        for d in detected {
            match self.record_one(d, &by_address, now).await {
                Ok(RecordOutcome::Recorded(deposit)) => recorded.deposits.push(deposit),
                Ok(RecordOutcome::Duplicate) => {
                    debug!(chain = %chain, tx_hash = %d.tx_hash, "Deposit already recorded");
                }
                Ok(RecordOutcome::Dust) => {
                    debug!(
                        chain = %chain,
                        tx_hash = %d.tx_hash,
                        asset = %d.asset,
                        amount = %d.amount,
                        "Ignoring dust deposit"
                    );
                }
                Ok(RecordOutcome::UnknownAddress) => {
                    debug!(chain = %chain, to = %d.to_address, "Deposit to unknown address");
                }
                Err(e) => {
                    warn!(
                        chain = %chain,
                        tx_hash = %d.tx_hash,
                        error = %e,
                        "Failed to record deposit"
                    );
                    recorded.failed += 1;
                }
            }
        }
        recorded
    }

    async fn record_one(
        &self,
        d: &DetectedDeposit,
        by_address: &HashMap<String, &DepositAddress>,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, CustodyError> {
        let chain = self.adapter.chain();
        let Some(address) = by_address.get(&address_key(chain.is_evm(), &d.to_address)) else {
            return Ok(RecordOutcome::UnknownAddress);
        };
        let config = self.adapter.config();
        if d.amount <= Decimal::ZERO || d.amount < config.dust_threshold(&d.asset) {
            return Ok(RecordOutcome::Dust);
        }

        let amount_usd = self.oracle.price_of(&d.asset, d.amount, chain).await;
        if amount_usd.is_none() {
            warn!(chain = %chain, asset = %d.asset, tx_hash = %d.tx_hash, "Deposit recorded unpriced");
        }

        let inserted = self
            .ledger
            .insert_deposit(NewDeposit {
                deposit_address_id: address.id,
                user_id: address.user_id,
                chain,
                asset: d.asset.clone(),
                amount: d.amount,
                amount_usd,
                tx_hash: d.tx_hash.clone(),
                block_number: d.block_number,
                block_hash: d.block_hash.clone(),
                confirmations: d.confirmations,
                detected_at: now,
            })
            .await?;
        let Some(deposit) = inserted else {
            return Ok(RecordOutcome::Duplicate);
        };

        info!(
            chain = %chain,
            deposit_id = deposit.id,
            user_id = deposit.user_id,
            asset = %deposit.asset,
            amount = %deposit.amount,
            tx_hash = %deposit.tx_hash,
            "Detected deposit"
        );

        if config
            .asset_by_symbol(&d.asset)
            .is_none_or(|a| a.is_native())
        {
            self.refresh_cached_balance(address, now).await;
        }
        Ok(RecordOutcome::Recorded(deposit))
    }

    async fn refresh_cached_balance(&self, address: &DepositAddress, now: DateTime<Utc>) {
        let result = async {
            let balance = self.adapter.native_balance(&address.address).await?;
            self.ledger
                .update_cached_balance(address.id, balance, now)
                .await?;
            Ok::<_, CustodyError>(())
        }
        .await;
        if let Err(e) = result {
            debug!(address = %address.address, error = %e, "Cached balance refresh failed");
        }
    }

    /// Credit a deposit that reached its confirmation threshold. Unpriced
    /// deposits are re-priced first; still unpriced means `UnresolvedPrice`
    /// and the deposit waits for the next tick.
    pub async fn credit(
        &self,
        deposit: &Deposit,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, CustodyError> {
        if deposit.amount_usd.is_none() {
            let usd = self
                .oracle
                .price_of(&deposit.asset, deposit.amount, deposit.chain)
                .await
                .ok_or_else(|| CustodyError::UnresolvedPrice {
                    asset: deposit.asset.clone(),
                    chain: deposit.chain,
                })?;
            self.ledger.set_deposit_usd(deposit.id, usd).await?;
        }

        let credited = self
            .ledger
            .credit_deposit(deposit.id, confirmations, now)
            .await?;
        if credited {
            info!(
                chain = %deposit.chain,
                deposit_id = deposit.id,
                user_id = deposit.user_id,
                confirmations,
                "Deposit confirmed and credited"
            );
        }
        Ok(credited)
    }
}

fn address_key(case_insensitive: bool, address: &str) -> String {
    if case_insensitive {
        address.to_lowercase()
    } else {
        address.to_string()
    }
}
