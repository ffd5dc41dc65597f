//! Chain Watcher - per-chain polling loop
//!
//! One watcher per configured chain. Each tick:
//! 1. node health check (stale or syncing node skips the tick)
//! 2. scan for deposits to watched addresses from the in-memory cursor
//! 3. record detected deposits through the pipeline; the cursor only moves
//!    past a range once every transfer in it is in the ledger
//! 4. refresh confirmations and credit deposits that reached the threshold
//!
//! An EVM cursor starts at the newest recorded deposit block, so a restart
//! re-scans the gap instead of jumping to the head.
//!
//! The watcher's state is owned by the instance: `monitoring` gates the loop
//! and a tick that overlaps another tick is skipped. Stopping mid-tick lets
//! in-flight RPC calls finish but discards their results.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::confirmation::{ConfirmationMonitor, ConfirmationReport};
use super::pipeline::DepositPipeline;
use crate::chain::{ChainAdapter, NodeHealth, ScanCursor};
use crate::core_types::Chain;
use crate::error::CustodyError;
use crate::ledger::LedgerStore;
use crate::oracle::PriceOracle;
use crate::scheduler::{Clock, Ticker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Previous tick still running
    Overlap,
    StaleNode,
    /// Watcher stopped while the tick was in flight
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: Option<SkipReason>,
    pub detected: usize,
    pub recorded: usize,
    pub confirmations: ConfirmationReport,
}

impl TickReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// Clears the in-flight flag when a tick ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChainWatcher {
    adapter: Arc<dyn ChainAdapter>,
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    pipeline: DepositPipeline,
    monitor: ConfirmationMonitor,
    monitoring: AtomicBool,
    in_flight: AtomicBool,
    cursor: Mutex<ScanCursor>,
}

impl ChainWatcher {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        ledger: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline: DepositPipeline::new(adapter.clone(), ledger.clone(), oracle),
            monitor: ConfirmationMonitor::new(adapter.clone(), ledger.clone()),
            adapter,
            ledger,
            clock,
            monitoring: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            cursor: Mutex::new(ScanCursor::default()),
        }
    }

    pub fn chain(&self) -> Chain {
        self.adapter.chain()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    pub async fn cursor(&self) -> ScanCursor {
        self.cursor.lock().await.clone()
    }

    /// Start the poll loop. Returns `None` if the watcher is already running.
    pub fn start(self: &Arc<Self>, mut ticker: Box<dyn Ticker>) -> Option<JoinHandle<()>> {
        if self.monitoring.swap(true, Ordering::AcqRel) {
            warn!(chain = %self.chain(), "Watcher already monitoring");
            return None;
        }
        info!(
            chain = %self.chain(),
            confirmations = self.adapter.config().confirmations,
            "Watcher started"
        );

        let watcher = Arc::clone(self);
        Some(tokio::spawn(async move {
            while watcher.is_monitoring() && ticker.tick().await {
                if !watcher.is_monitoring() {
                    break;
                }
                match watcher.tick().await {
                    Ok(report) => {
                        if report.recorded > 0 || report.confirmations.credited > 0 {
                            info!(
                                chain = %watcher.chain(),
                                recorded = report.recorded,
                                credited = report.confirmations.credited,
                                "Watcher tick"
                            );
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(chain = %watcher.chain(), error = %e, "Watcher tick failed, retrying next tick");
                    }
                    Err(e) => {
                        error!(chain = %watcher.chain(), error = %e, code = e.code(), "Watcher tick failed");
                    }
                }
            }
            watcher.monitoring.store(false, Ordering::Release);
            info!(chain = %watcher.chain(), "Watcher stopped");
        }))
    }

    /// Stop monitoring; an in-flight tick completes but its results are
    /// discarded
    pub fn stop(&self) {
        if self.monitoring.swap(false, Ordering::AcqRel) {
            info!(chain = %self.chain(), "Watcher stopping");
        }
    }

    /// One poll cycle. Callable directly (one-shot runs, tests) whether or
    /// not the loop is running.
    pub async fn tick(&self) -> Result<TickReport, CustodyError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(chain = %self.chain(), "Previous tick still running, skipping");
            return Ok(TickReport::skipped(SkipReason::Overlap));
        }
        let _guard = InFlight(&self.in_flight);
        let started_monitoring = self.is_monitoring();
        let cancelled = || started_monitoring && !self.is_monitoring();

        let chain = self.chain();
        let now = self.clock.now();
        let health = self.adapter.health_check().await?;
        if self.node_is_stale(&health, now) {
            return Ok(TickReport::skipped(SkipReason::StaleNode));
        }
        self.seed_cursor(health.head).await?;

        let watched = self.ledger.watched_addresses(chain).await?;
        let cursor = self.cursor.lock().await.clone();
        let batch = self.adapter.scan_for_deposits(&cursor, &watched).await?;
        if cancelled() {
            debug!(chain = %chain, "Watcher stopped mid-tick, discarding scan");
            return Ok(TickReport::skipped(SkipReason::Stopped));
        }

        let recorded = self
            .pipeline
            .record_detected(&batch.deposits, &watched, now)
            .await;
        if recorded.failed == 0 {
            *self.cursor.lock().await = batch.cursor;
        } else {
            warn!(
                chain = %chain,
                failed = recorded.failed,
                cursor = ?cursor.last_block,
                "Deposits not recorded, range will be scanned again"
            );
        }

        if cancelled() {
            return Ok(TickReport {
                skipped: Some(SkipReason::Stopped),
                detected: batch.deposits.len(),
                recorded: recorded.deposits.len(),
                ..Default::default()
            });
        }
        let confirmations = self.monitor.update_confirmations(&self.pipeline, now).await?;

        Ok(TickReport {
            skipped: None,
            detected: batch.deposits.len(),
            recorded: recorded.deposits.len(),
            confirmations,
        })
    }

    fn node_is_stale(&self, health: &NodeHealth, now: DateTime<Utc>) -> bool {
        let max_lag = self.adapter.config().max_block_lag_secs;
        if health.is_stale(now.timestamp(), max_lag) {
            warn!(
                chain = %self.chain(),
                head = health.head,
                head_time = ?health.head_time,
                syncing = health.syncing,
                "Node is stale, skipping tick"
            );
            return true;
        }
        false
    }

    /// First EVM tick: resume from the newest recorded deposit block, else
    /// `start_block`, else `cold_start_lookback_blocks` behind the head
    async fn seed_cursor(&self, head: u64) -> Result<(), CustodyError> {
        let chain = self.chain();
        let mut cursor = self.cursor.lock().await;
        if cursor.last_block.is_some() || !chain.is_evm() {
            return Ok(());
        }
        let config = self.adapter.config();
        let recorded = self.ledger.latest_deposit_block(chain).await?;
        let from = match (recorded, config.start_block) {
            (Some(block), start) => block.max(start.unwrap_or(0)),
            (None, Some(start)) => start,
            (None, None) => head.saturating_sub(config.cold_start_lookback_blocks),
        };
        cursor.last_block = Some(from.saturating_sub(1));
        info!(chain = %chain, from, head, recorded = ?recorded, "Scan cursor seeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockChain, mock_config};
    use crate::ledger::{
        AddressStore, DepositStatus, DepositStore, MemoryLedger, NewDeposit, NewDepositAddress,
    };
    use crate::oracle::StaticPriceOracle;
    use crate::scheduler::{ManualClock, ManualTicker};
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct Fixture {
        chain: Arc<MockChain>,
        ledger: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
        watcher: Arc<ChainWatcher>,
    }

    async fn fixture() -> Fixture {
        let chain = Arc::new(MockChain::new(mock_config(Chain::Base)));
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let oracle = Arc::new(StaticPriceOracle::new(
            [("USDC".to_string(), Decimal::ONE)].into_iter().collect(),
        ));
        ledger
            .insert_deposit_address(
                NewDepositAddress {
                    user_id: 1,
                    chain: Chain::Base,
                    address: "0xaa".to_string(),
                    derivation_index: 0,
                },
                clock.now(),
            )
            .await
            .unwrap();
        let watcher = Arc::new(ChainWatcher::new(
            chain.clone(),
            ledger.clone(),
            oracle,
            clock.clone(),
        ));
        Fixture {
            chain,
            ledger,
            clock,
            watcher,
        }
    }

    #[tokio::test]
    async fn test_tick_detects_and_credits() {
        let f = fixture().await;
        f.chain
            .push_deposit("0x1", "0xaa", "USDC", Decimal::new(100, 0), 100);

        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.recorded, 1);
        assert_eq!(report.confirmations.credited, 0);

        f.chain.set_head(103);
        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.confirmations.credited, 1);
        assert_eq!(f.ledger.user_balance(1).await.unwrap(), Decimal::new(100, 0));
        assert_eq!(f.watcher.cursor().await.last_block, Some(103));
    }

    #[tokio::test]
    async fn test_unrecorded_deposit_scanned_again() {
        let f = fixture().await;
        f.chain
            .push_deposit("0x1", "0xaa", "USDC", Decimal::new(100, 0), 100);
        f.ledger.set_fail_deposit_inserts(true);

        let report = f.watcher.tick().await.unwrap();
        assert_eq!((report.detected, report.recorded), (1, 0));
        assert_eq!(f.watcher.cursor().await.last_block, Some(0));

        f.ledger.set_fail_deposit_inserts(false);
        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.recorded, 1);
        assert!(f.ledger.deposit_by_tx_hash("0x1").await.unwrap().is_some());
        assert_eq!(f.watcher.cursor().await.last_block, Some(100));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_recorded_block() {
        let f = fixture().await;
        let address = f
            .ledger
            .find_deposit_address(1, Chain::Base)
            .await
            .unwrap()
            .unwrap();
        f.ledger
            .insert_deposit(NewDeposit {
                deposit_address_id: address.id,
                user_id: 1,
                chain: Chain::Base,
                asset: "USDC".to_string(),
                amount: Decimal::new(20, 0),
                amount_usd: Some(Decimal::new(20, 0)),
                tx_hash: "0xold".to_string(),
                block_number: Some(90),
                block_hash: Some(MockChain::block_hash(90)),
                confirmations: 3,
                detected_at: f.clock.now(),
            })
            .await
            .unwrap();
        // landed while the process was down, far behind the new head
        f.chain
            .push_deposit("0xmissed", "0xaa", "USDC", Decimal::new(50, 0), 95);
        f.chain.set_head(5_000);

        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.recorded, 1);
        assert!(f.ledger.deposit_by_tx_hash("0xmissed").await.unwrap().is_some());
        assert_eq!(f.watcher.cursor().await.last_block, Some(5_000));
    }

    #[tokio::test]
    async fn test_stale_node_skips_tick() {
        let f = fixture().await;
        f.chain
            .set_head_time(Some(f.clock.now().timestamp() - 3600));
        f.chain
            .push_deposit("0x1", "0xaa", "USDC", Decimal::new(100, 0), 100);
        let report = f.watcher.tick().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::StaleNode));
        assert_eq!(f.chain.scans(), 0);
    }

    #[tokio::test]
    async fn test_scan_error_is_transient() {
        let f = fixture().await;
        f.chain
            .set_scan_error(Some(crate::chain::ChainError::Rpc("down".into())));
        let err = f.watcher.tick().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_start_stop_loop() {
        let f = fixture().await;
        let (ticker, handle) = ManualTicker::new();
        let join = f.watcher.start(Box::new(ticker)).unwrap();
        assert!(f.watcher.is_monitoring());
        assert!(f.watcher.start(Box::new(ManualTicker::new().0)).is_none());

        f.chain
            .push_deposit("0x1", "0xaa", "USDC", Decimal::new(50, 0), 100);
        handle.fire();
        for _ in 0..100 {
            if !f
                .ledger
                .deposits_in_status(None, &[DepositStatus::Confirming, DepositStatus::Pending])
                .await
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.chain.scans(), 1);

        f.watcher.stop();
        handle.fire();
        join.await.unwrap();
        assert!(!f.watcher.is_monitoring());
        assert_eq!(f.chain.scans(), 1);
    }

    #[tokio::test]
    async fn test_isolated_instances() {
        let a = fixture().await;
        let b = fixture().await;
        a.chain
            .push_deposit("0x1", "0xaa", "USDC", Decimal::new(10, 0), 100);
        a.watcher.tick().await.unwrap();
        b.watcher.tick().await.unwrap();
        assert_eq!(a.chain.scans(), 1);
        assert_eq!(b.chain.scans(), 1);
        assert!(b.ledger.deposit_by_tx_hash("0x1").await.unwrap().is_none());
    }
}
