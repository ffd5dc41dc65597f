//! Settlement Queue
//!
//! Outbound payouts from the vault to campaign participants:
//! - creation: due participants become PENDING payouts priced in the active
//!   settlement token
//! - execution: FIFO batches, each payout claimed `PENDING -> EXECUTING`
//!   before anything is sent, paced by a fixed inter-payout delay
//! - migration: repoint still-PENDING payouts when the settlement token moves
//!
//! Delivery is at-least-once from the chain's point of view; the ledger
//! status makes every payout observable and never executed twice by this
//! process.

mod creation;
mod execution;

pub use creation::CreationReport;
pub use execution::PayoutRunReport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::Alerter;
use crate::chain::ChainRegistry;
use crate::config::{AssetConfig, ChainConfig, SettlementQueueConfig};
use crate::core_types::Chain;
use crate::error::CustodyError;
use crate::ledger::LedgerStore;
use crate::oracle::PriceOracle;
use crate::scheduler::{Clock, Ticker};

pub struct SettlementQueue {
    chains: ChainRegistry,
    ledger: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
    alerter: Arc<dyn Alerter>,
    clock: Arc<dyn Clock>,
    config: SettlementQueueConfig,
    running: AtomicBool,
}

impl SettlementQueue {
    pub fn new(
        chains: ChainRegistry,
        ledger: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
        alerter: Arc<dyn Alerter>,
        clock: Arc<dyn Clock>,
        config: SettlementQueueConfig,
    ) -> Self {
        Self {
            chains,
            ledger,
            oracle,
            alerter,
            clock,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(self: &Arc<Self>, mut ticker: Box<dyn Ticker>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        info!(
            batch_limit = self.config.batch_limit,
            delay_ms = self.config.inter_payout_delay_ms,
            "Settlement scheduler started"
        );
        let queue = Arc::clone(self);
        Some(tokio::spawn(async move {
            while queue.running.load(Ordering::Acquire) && ticker.tick().await {
                if !queue.running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = queue.create_due_payouts().await {
                    warn!(error = %e, code = e.code(), "Payout creation skipped");
                }
                if let Err(e) = queue.process_payout_queue(queue.config.batch_limit).await {
                    error!(error = %e, code = e.code(), "Payout run failed");
                }
            }
            queue.running.store(false, Ordering::Release);
            info!("Settlement scheduler stopped");
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Repoint every PENDING payout to `token_address` on `chain`.
    /// EXECUTING, CONFIRMED and FAILED rows are left alone.
    pub async fn migrate_settlement(
        &self,
        token_address: &str,
        chain: Chain,
    ) -> Result<u64, CustodyError> {
        match self.chains.get(chain) {
            Some(adapter) if resolve_asset(adapter.config(), token_address).is_none() => {
                warn!(
                    chain = %chain,
                    token = %token_address,
                    "Migrating to a token this chain has no asset config for"
                );
            }
            None => warn!(chain = %chain, "Migrating to a chain without an adapter"),
            _ => {}
        }
        let moved = self
            .ledger
            .migrate_pending_payouts(token_address, chain)
            .await?;
        info!(chain = %chain, token = %token_address, payouts = moved, "Settlement migrated");
        Ok(moved)
    }
}

/// Asset a payout's `token_address` refers to: a configured contract/mint,
/// or the native asset by symbol
pub(crate) fn resolve_asset(config: &ChainConfig, token_address: &str) -> Option<AssetConfig> {
    if let Some(asset) = config.asset_by_contract(token_address) {
        return Some(asset.clone());
    }
    let native = config.native_asset();
    native
        .symbol
        .eq_ignore_ascii_case(token_address)
        .then_some(native)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::chain::mock::{MockChain, mock_config};
    use crate::ledger::{MemoryLedger, NewPayout, PayoutStatus, SettlementStore};
    use crate::oracle::StaticPriceOracle;
    use crate::scheduler::ManualClock;
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[test]
    fn test_resolve_asset() {
        let config = mock_config(Chain::Base);
        assert_eq!(resolve_asset(&config, "0xUSDC").unwrap().symbol, "USDC");
        assert!(resolve_asset(&config, "eth").unwrap().is_native());
        assert!(resolve_asset(&config, "0xother").is_none());
    }

    #[tokio::test]
    async fn test_migrate_only_pending() {
        let mut registry = ChainRegistry::new();
        registry.insert(Arc::new(MockChain::new(mock_config(Chain::Solana))));
        let ledger = Arc::new(MemoryLedger::new());
        let queue = SettlementQueue::new(
            registry,
            ledger.clone(),
            Arc::new(StaticPriceOracle::default()),
            Arc::new(RecordingAlerter::default()),
            Arc::new(ManualClock::new(Utc::now())),
            SettlementQueueConfig::default(),
        );

        let mut ids = Vec::new();
        for participant_id in 1..=2 {
            let payout = ledger
                .insert_payout(NewPayout {
                    participant_id,
                    user_id: participant_id,
                    trench_id: 1,
                    amount: Decimal::new(10, 0),
                    amount_usd: Decimal::new(10, 0),
                    to_address: "0xuser".to_string(),
                    token_address: "0xusdc".to_string(),
                    chain: Chain::Base,
                    created_at: Utc::now(),
                })
                .await
                .unwrap()
                .unwrap();
            ids.push(payout.id);
        }
        assert!(ledger.claim_payout(ids[0], Utc::now()).await.unwrap());

        let moved = queue.migrate_settlement("usdcMint", Chain::Solana).await.unwrap();
        assert_eq!(moved, 1);
        let executing = ledger.payout(ids[0]).await.unwrap().unwrap();
        assert_eq!(executing.status, PayoutStatus::Executing);
        assert_eq!(executing.chain, Chain::Base);
        let pending = ledger.payout(ids[1]).await.unwrap().unwrap();
        assert_eq!(pending.chain, Chain::Solana);
        assert_eq!(pending.token_address, "usdcMint");
    }
}
