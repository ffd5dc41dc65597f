//! Sweep Engine
//!
//! Consolidates CONFIRMED deposits into the chain's vault.
//!
//! Per chain and run:
//! 1. pick unbatched CONFIRMED deposits (oldest confirmation first, capped)
//! 2. skip when their USD total is below the chain's `min_sweep_usd`
//! 3. create the batch and link the deposits in one ledger call, before any
//!    transfer, so overlapping runs cannot pick the same deposits
//! 4. move each source's funds with its on-demand derived key; deposits
//!    sharing an address and asset are drained by a single transfer
//!
//! Item failures are collected, never abort the batch. A batch with at least
//! one swept item is COMPLETED, otherwise FAILED. Failed items stay linked
//! until [`SweepEngine::retry_failed_sweeps`] releases them.

use dashmap::DashSet;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEvent, AlertKind, Alerter};
use crate::chain::{ChainAdapter, ChainRegistry, SweepSource, SweepTransfer};
use crate::config::SweepConfig;
use crate::core_types::{Chain, DepositAddressId, SweepBatchId};
use crate::error::CustodyError;
use crate::keys::KeyBranch;
use crate::ledger::{Deposit, LedgerError, LedgerStore, SweepStatus};
use crate::scheduler::{Clock, Ticker};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SweepSkip {
    NothingToSweep,
    BelowMinimum { total_usd: Decimal, min_usd: Decimal },
    /// Another sweep of this chain is running in this process
    InProgress,
    /// Candidates were linked by a concurrent sweep between read and link
    Raced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub chain: Chain,
    pub skipped: Option<SweepSkip>,
    pub batch_id: Option<SweepBatchId>,
    pub status: Option<SweepStatus>,
    pub succeeded: usize,
    pub failed: usize,
    pub tx_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl SweepReport {
    fn skipped(chain: Chain, reason: SweepSkip) -> Self {
        Self {
            chain,
            skipped: Some(reason),
            batch_id: None,
            status: None,
            succeeded: 0,
            failed: 0,
            tx_ids: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Removes the chain from the in-progress set when the sweep ends
struct Sweeping<'a> {
    set: &'a DashSet<Chain>,
    chain: Chain,
}

impl Drop for Sweeping<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.chain);
    }
}

pub struct SweepEngine {
    chains: ChainRegistry,
    ledger: Arc<dyn LedgerStore>,
    alerter: Arc<dyn Alerter>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
    running: AtomicBool,
    sweeping: DashSet<Chain>,
}

impl SweepEngine {
    pub fn new(
        chains: ChainRegistry,
        ledger: Arc<dyn LedgerStore>,
        alerter: Arc<dyn Alerter>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            chains,
            ledger,
            alerter,
            clock,
            config,
            running: AtomicBool::new(false),
            sweeping: DashSet::new(),
        }
    }

    pub fn start(self: &Arc<Self>, mut ticker: Box<dyn Ticker>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        info!(
            chains = ?self.chains.chains(),
            batch_size = self.config.batch_size,
            "Sweep scheduler started"
        );
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            while engine.running.load(Ordering::Acquire) && ticker.tick().await {
                if !engine.running.load(Ordering::Acquire) {
                    break;
                }
                engine.sweep_all().await;
            }
            engine.running.store(false, Ordering::Release);
            info!("Sweep scheduler stopped");
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Sweep every configured chain concurrently
    pub async fn sweep_all(&self) -> Vec<SweepReport> {
        let chains = self.chains.chains();
        let results = join_all(chains.iter().map(|c| self.sweep_chain(*c))).await;
        let mut reports = Vec::with_capacity(results.len());
        for (chain, result) in chains.into_iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) if e.is_transient() => {
                    warn!(chain = %chain, error = %e, "Sweep deferred");
                }
                Err(e) => {
                    error!(chain = %chain, error = %e, code = e.code(), "Sweep failed");
                }
            }
        }
        reports
    }

    /// Operator entry point; same path as the scheduler
    pub async fn trigger_manual_sweep(&self, chain: Chain) -> Result<SweepReport, CustodyError> {
        info!(chain = %chain, "Manual sweep triggered");
        self.sweep_chain(chain).await
    }

    pub async fn sweep_chain(&self, chain: Chain) -> Result<SweepReport, CustodyError> {
        let adapter = self.chains.get(chain).ok_or_else(|| {
            CustodyError::ConfigurationMissing(format!("no adapter for {}", chain))
        })?;
        if !self.sweeping.insert(chain) {
            debug!(chain = %chain, "Sweep already in progress");
            return Ok(SweepReport::skipped(chain, SweepSkip::InProgress));
        }
        let _guard = Sweeping {
            set: &self.sweeping,
            chain,
        };

        let candidates = self
            .ledger
            .sweepable_deposits(chain, self.config.batch_size)
            .await?;
        if candidates.is_empty() {
            return Ok(SweepReport::skipped(chain, SweepSkip::NothingToSweep));
        }
        let total_usd: Decimal = candidates.iter().filter_map(|d| d.amount_usd).sum();
        let min_usd = adapter.config().min_sweep_usd;
        if total_usd < min_usd {
            debug!(
                chain = %chain,
                total_usd = %total_usd,
                min_usd = %min_usd,
                "Sweep value below minimum"
            );
            return Ok(SweepReport::skipped(
                chain,
                SweepSkip::BelowMinimum { total_usd, min_usd },
            ));
        }
        let vault = self.vault_for(adapter.as_ref()).await?;

        let now = self.clock.now();
        let ids: Vec<_> = candidates.iter().map(|d| d.id).collect();
        let Some((batch, linked)) = self.ledger.create_sweep_batch(chain, &ids, now).await? else {
            return Ok(SweepReport::skipped(chain, SweepSkip::Raced));
        };
        info!(
            chain = %chain,
            batch_id = batch.id,
            deposits = batch.deposit_count,
            total_usd = %batch.total_usd,
            vault = %vault,
            "Sweep batch created"
        );

        let mut report = SweepReport {
            chain,
            skipped: None,
            batch_id: Some(batch.id),
            status: None,
            succeeded: 0,
            failed: 0,
            tx_ids: Vec::new(),
            errors: Vec::new(),
        };
        let mut gas_cost = Decimal::ZERO;
        for group in group_by_source(&linked) {
            let ids = group.iter().map(|d| d.id.to_string()).collect::<Vec<_>>().join(",");
            match self.sweep_source(adapter.as_ref(), &group, &vault).await {
                Ok(transfer) => {
                    for deposit in &group {
                        if let Err(e) = self
                            .ledger
                            .mark_deposit_swept(deposit.id, &transfer.tx_id, self.clock.now())
                            .await
                        {
                            error!(
                                deposit_id = deposit.id,
                                tx_id = %transfer.tx_id,
                                error = %e,
                                "Funds moved but deposit not marked swept"
                            );
                        }
                    }
                    debug!(
                        deposits = %ids,
                        tx_id = %transfer.tx_id,
                        amount = %transfer.amount,
                        "Deposits swept"
                    );
                    gas_cost += transfer.fee;
                    report.succeeded += group.len();
                    report.tx_ids.push(transfer.tx_id);
                }
                Err(e) => {
                    warn!(chain = %chain, deposits = %ids, error = %e, "Sweep item failed");
                    report.failed += group.len();
                    report.errors.push(format!("deposits {}: {}", ids, e));
                }
            }
        }

        let status = if report.succeeded > 0 {
            SweepStatus::Completed
        } else {
            SweepStatus::Failed
        };
        report.status = Some(status);
        let tx_hash = (!report.tx_ids.is_empty()).then(|| report.tx_ids.join(","));
        let gas_cost = (report.succeeded > 0).then_some(gas_cost);
        self.ledger
            .finish_sweep_batch(batch.id, status, tx_hash, gas_cost, self.clock.now())
            .await?;

        info!(
            chain = %chain,
            batch_id = batch.id,
            status = %status,
            succeeded = report.succeeded,
            failed = report.failed,
            "Sweep batch finished"
        );
        if report.failed > 0 {
            self.alerter
                .alert(AlertEvent::new(
                    AlertKind::SweepFailed {
                        chain,
                        batch_id: batch.id,
                        failed: report.failed,
                        succeeded: report.succeeded,
                        errors: report.errors.clone(),
                    },
                    self.clock.now(),
                ))
                .await;
        }
        Ok(report)
    }

    /// Ledger-configured vault, else the adapter's own vault key
    async fn vault_for(&self, adapter: &dyn ChainAdapter) -> Result<String, CustodyError> {
        if let Some(vault) = self.ledger.vault_address(adapter.chain()).await? {
            return Ok(vault);
        }
        adapter.vault_address().map_err(|e| {
            CustodyError::ConfigurationMissing(format!(
                "no vault for {}: {}",
                adapter.chain(),
                e
            ))
        })
    }

    /// One transfer for deposits that share an address and asset
    async fn sweep_source(
        &self,
        adapter: &dyn ChainAdapter,
        group: &[&Deposit],
        vault: &str,
    ) -> Result<SweepTransfer, CustodyError> {
        let Some(deposit) = group.first() else {
            return Err(LedgerError::Invariant("empty sweep group".to_string()).into());
        };
        let asset = adapter
            .config()
            .asset_by_symbol(&deposit.asset)
            .cloned()
            .ok_or_else(|| {
                CustodyError::ConfigurationMissing(format!(
                    "asset {} not configured on {}",
                    deposit.asset, deposit.chain
                ))
            })?;
        let address = self
            .ledger
            .deposit_address_by_id(deposit.deposit_address_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("deposit address {}", deposit.deposit_address_id))
            })?;
        let source = SweepSource {
            branch: KeyBranch::Deposit(address.derivation_index),
            address: address.address,
            asset,
            amount: group.iter().map(|d| d.amount).sum(),
        };
        Ok(adapter
            .sweep_address(&source, vault, self.config.fee_multiplier)
            .await?)
    }

    /// Unlink and delete every FAILED batch of `chain` and unlink the
    /// failed items of COMPLETED batches; returns the number of deposits
    /// made eligible again
    pub async fn retry_failed_sweeps(&self, chain: Chain) -> Result<u64, CustodyError> {
        let failed = self
            .ledger
            .sweep_batches(chain, SweepStatus::Failed)
            .await?;
        let mut released = 0;
        for batch in failed {
            let n = self.ledger.release_sweep_batch(batch.id).await?;
            info!(chain = %chain, batch_id = batch.id, deposits = n, "Released failed sweep batch");
            released += n;
        }
        let stranded = self.ledger.release_unswept_deposits(chain).await?;
        if stranded > 0 {
            info!(chain = %chain, deposits = stranded, "Released unswept items of completed batches");
        }
        Ok(released + stranded)
    }
}

/// Group deposits by (address, asset), keeping first-seen order
fn group_by_source(deposits: &[Deposit]) -> Vec<Vec<&Deposit>> {
    let mut groups: Vec<Vec<&Deposit>> = Vec::new();
    let mut index: HashMap<(DepositAddressId, &str), usize> = HashMap::new();
    for d in deposits {
        match index.entry((d.deposit_address_id, d.asset.as_str())) {
            Entry::Occupied(e) => groups[*e.get()].push(d),
            Entry::Vacant(e) => {
                e.insert(groups.len());
                groups.push(vec![d]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::chain::mock::{MockChain, mock_config};
    use crate::ledger::{
        AddressStore, DepositStatus, DepositStore, MemoryLedger, NewDepositAddress, SweepStore,
    };
    use crate::scheduler::ManualClock;
    use chrono::{DateTime, Utc};

    struct Fixture {
        chain: Arc<MockChain>,
        ledger: Arc<MemoryLedger>,
        alerts: Arc<RecordingAlerter>,
        engine: SweepEngine,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MockChain::new(mock_config(Chain::Base)));
        let mut registry = ChainRegistry::new();
        registry.insert(chain.clone());
        let ledger = Arc::new(MemoryLedger::new());
        let alerts = Arc::new(RecordingAlerter::default());
        let now = Utc::now();
        let engine = SweepEngine::new(
            registry,
            ledger.clone(),
            alerts.clone(),
            Arc::new(ManualClock::new(now)),
            SweepConfig::default(),
        );
        Fixture {
            chain,
            ledger,
            alerts,
            engine,
            now,
        }
    }

    impl Fixture {
        /// Confirmed deposit on a fresh address with derivation index `index`
        async fn confirmed(&self, index: u32, asset: &str, amount: Decimal, usd: i64) -> Deposit {
            let address = format!("0xdep{}", index);
            let row = self
                .ledger
                .insert_deposit_address(
                    NewDepositAddress {
                        user_id: index as i64,
                        chain: Chain::Base,
                        address: address.clone(),
                        derivation_index: index,
                    },
                    self.now,
                )
                .await
                .unwrap();
            self.chain.bind_branch(KeyBranch::Deposit(index), &address);
            self.chain.set_balance(&address, asset, amount);
            let deposit = Deposit {
                id: 1000 + index as i64,
                deposit_address_id: row.id,
                user_id: index as i64,
                chain: Chain::Base,
                asset: asset.to_string(),
                amount,
                amount_usd: Some(Decimal::new(usd, 0)),
                tx_hash: format!("0xtx{}", index),
                block_number: Some(90),
                block_hash: Some(MockChain::block_hash(90)),
                confirmations: 3,
                status: DepositStatus::Confirmed,
                sweep_batch_id: None,
                sweep_tx_hash: None,
                detected_at: self.now,
                confirmed_at: Some(self.now),
                safe_at: Some(self.now),
                swept_at: None,
            };
            self.ledger.put_deposit(deposit.clone());
            deposit
        }

        /// Another confirmed deposit on the address of `first`
        fn same_address(&self, first: &Deposit, id: i64, amount: Decimal, usd: i64) -> Deposit {
            let deposit = Deposit {
                id,
                amount,
                amount_usd: Some(Decimal::new(usd, 0)),
                tx_hash: format!("0xtx{}", id),
                ..first.clone()
            };
            self.ledger.put_deposit(deposit.clone());
            deposit
        }
    }

    #[tokio::test]
    async fn test_native_sweep_reserves_fee() {
        let f = fixture();
        let d = f.confirmed(1, "ETH", Decimal::ONE, 3000).await;

        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Completed));
        assert_eq!(report.succeeded, 1);

        let transfers = f.chain.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].to, "VAULT");
        // 0.001 fee * 1.2 multiplier
        assert_eq!(transfers[0].amount, Decimal::new(9988, 4));

        let swept = f.ledger.deposit(d.id).await.unwrap().unwrap();
        assert_eq!(swept.status, DepositStatus::Swept);
        assert_eq!(swept.sweep_tx_hash.as_deref(), Some("0xmocktx1"));
        let batch = f
            .ledger
            .sweep_batch(report.batch_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.total_amount, Decimal::ONE);
        assert_eq!(batch.tx_hash.as_deref(), Some("0xmocktx1"));
    }

    #[tokio::test]
    async fn test_below_minimum_creates_no_batch() {
        let f = fixture();
        f.confirmed(1, "USDC", Decimal::new(5, 0), 5).await;
        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert!(matches!(report.skipped, Some(SweepSkip::BelowMinimum { .. })));
        assert!(f.chain.transfers().is_empty());
        assert!(
            f.ledger
                .sweep_batches(Chain::Base, SweepStatus::Pending)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_partial_failure_completes_batch() {
        let f = fixture();
        f.confirmed(1, "ETH", Decimal::ONE, 3000).await;
        // does not cover the fee
        let dust = f.confirmed(2, "ETH", Decimal::new(1, 3), 3).await;

        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Completed));
        assert_eq!((report.succeeded, report.failed), (1, 1));
        let left = f.ledger.deposit(dust.id).await.unwrap().unwrap();
        assert_eq!(left.status, DepositStatus::Confirmed);
        assert!(matches!(f.alerts.kinds()[0], AlertKind::SweepFailed { failed: 1, .. }));
    }

    #[tokio::test]
    async fn test_token_without_gas_fails_then_retries() {
        let f = fixture();
        let d = f.confirmed(1, "USDC", Decimal::new(100, 0), 100).await;

        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Failed));
        assert!(f.chain.transfers().is_empty());

        // linked to the failed batch, not eligible
        let again = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(again.skipped, Some(SweepSkip::NothingToSweep));

        assert_eq!(f.engine.retry_failed_sweeps(Chain::Base).await.unwrap(), 1);
        assert_eq!(
            f.ledger.deposit(d.id).await.unwrap().unwrap().sweep_batch_id,
            None
        );

        f.chain.set_balance("0xdep1", "ETH", Decimal::ONE);
        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Completed));
        assert_eq!(f.chain.balance("VAULT", "USDC"), Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_failed_item_of_completed_batch_retried() {
        let f = fixture();
        f.confirmed(1, "ETH", Decimal::ONE, 3000).await;
        // no gas for the token transfer
        let stuck = f.confirmed(2, "USDC", Decimal::new(100, 0), 100).await;

        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Completed));
        assert_eq!((report.succeeded, report.failed), (1, 1));

        let again = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(again.skipped, Some(SweepSkip::NothingToSweep));

        assert_eq!(f.engine.retry_failed_sweeps(Chain::Base).await.unwrap(), 1);
        f.chain.set_balance("0xdep2", "ETH", Decimal::ONE);
        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Completed));
        assert_eq!((report.succeeded, report.failed), (1, 0));

        let swept = f.ledger.deposit(stuck.id).await.unwrap().unwrap();
        assert_eq!(swept.status, DepositStatus::Swept);
        assert_eq!(f.chain.balance("VAULT", "USDC"), Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_deposits_on_same_address_swept_together() {
        let f = fixture();
        let first = f.confirmed(1, "USDC", Decimal::new(100, 0), 100).await;
        let second = f.same_address(&first, 2001, Decimal::new(50, 0), 50);
        f.chain.set_balance("0xdep1", "USDC", Decimal::new(150, 0));
        f.chain.set_balance("0xdep1", "ETH", Decimal::ONE);

        let report = f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(report.status, Some(SweepStatus::Completed));
        assert_eq!((report.succeeded, report.failed), (2, 0));
        assert!(f.alerts.kinds().is_empty());

        let transfers = f.chain.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, Decimal::new(150, 0));
        for id in [first.id, second.id] {
            let d = f.ledger.deposit(id).await.unwrap().unwrap();
            assert_eq!(d.status, DepositStatus::Swept);
            assert_eq!(d.sweep_tx_hash.as_deref(), Some("0xmocktx1"));
        }
    }

    #[tokio::test]
    async fn test_ledger_vault_preferred() {
        let f = fixture();
        f.ledger.set_vault(Chain::Base, "0xcold");
        f.confirmed(1, "USDC", Decimal::new(100, 0), 100).await;
        f.chain.set_balance("0xdep1", "ETH", Decimal::ONE);
        f.engine.sweep_chain(Chain::Base).await.unwrap();
        assert_eq!(f.chain.transfers()[0].to, "0xcold");
    }

    #[tokio::test]
    async fn test_unknown_chain_is_configuration_missing() {
        let f = fixture();
        let err = f.engine.sweep_chain(Chain::Solana).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_MISSING");
    }
}
