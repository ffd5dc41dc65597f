//! Custody service facade
//!
//! Wires the components over one ledger and one chain registry, runs them
//! as independent tokio tasks and exposes the operations the surrounding
//! API/admin layers call.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alert::Alerter;
use crate::allocator::{AddressAllocator, AllocatedAddress};
use crate::chain::ChainRegistry;
use crate::config::CustodyConfig;
use crate::core_types::{Chain, UserId};
use crate::error::CustodyError;
use crate::keys::SigningProvider;
use crate::ledger::{DepositAddress, DepositStats, LedgerStore, SweepStats};
use crate::oracle::PriceOracle;
use crate::reorg::{ReorgGuard, ReorgHealth, ReorgReport};
use crate::scheduler::{Clock, IntervalTicker};
use crate::sentinel::ChainWatcher;
use crate::settlement::{CreationReport, PayoutRunReport, SettlementQueue};
use crate::sweep::{SweepEngine, SweepReport};

/// Grace period for in-flight ticks on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Shared collaborators
pub struct ServiceDeps {
    pub ledger: Arc<dyn LedgerStore>,
    pub chains: ChainRegistry,
    /// `None` disables address allocation, sweeps and payouts
    pub signer: Option<Arc<dyn SigningProvider>>,
    pub oracle: Arc<dyn PriceOracle>,
    pub alerter: Arc<dyn Alerter>,
    pub clock: Arc<dyn Clock>,
}

pub struct CustodyService {
    config: CustodyConfig,
    ledger: Arc<dyn LedgerStore>,
    allocator: Option<AddressAllocator>,
    watchers: Vec<Arc<ChainWatcher>>,
    reorg: Arc<ReorgGuard>,
    sweeper: Option<Arc<SweepEngine>>,
    settlement: Option<Arc<SettlementQueue>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CustodyService {
    pub fn new(config: CustodyConfig, deps: ServiceDeps) -> Self {
        let ServiceDeps {
            ledger,
            chains,
            signer,
            oracle,
            alerter,
            clock,
        } = deps;

        let watchers = chains
            .chains()
            .into_iter()
            .filter_map(|c| chains.get(c))
            .map(|adapter| {
                Arc::new(ChainWatcher::new(
                    adapter,
                    ledger.clone(),
                    oracle.clone(),
                    clock.clone(),
                ))
            })
            .collect();
        let reorg = Arc::new(ReorgGuard::new(
            chains.clone(),
            ledger.clone(),
            alerter.clone(),
            clock.clone(),
            config.reorg.clone(),
        ));

        let (allocator, sweeper, settlement) = match signer {
            Some(signer) => (
                Some(AddressAllocator::new(ledger.clone(), signer, clock.clone())),
                Some(Arc::new(SweepEngine::new(
                    chains.clone(),
                    ledger.clone(),
                    alerter.clone(),
                    clock.clone(),
                    config.sweep.clone(),
                ))),
                Some(Arc::new(SettlementQueue::new(
                    chains,
                    ledger.clone(),
                    oracle,
                    alerter,
                    clock,
                    config.settlement.clone(),
                ))),
            ),
            None => {
                warn!("No signing provider: address allocation, sweeps and payouts disabled");
                (None, None, None)
            }
        };

        Self {
            config,
            ledger,
            allocator,
            watchers,
            reorg,
            sweeper,
            settlement,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn every periodic component
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        for watcher in &self.watchers {
            let interval = self
                .config
                .chain(watcher.chain())
                .map(|c| c.poll_interval_ms)
                .unwrap_or(15_000);
            tasks.extend(watcher.start(Box::new(IntervalTicker::from_millis(interval))));
        }
        tasks.extend(
            self.reorg
                .start(Box::new(IntervalTicker::from_millis(self.config.reorg.interval_ms))),
        );
        if let Some(sweeper) = &self.sweeper {
            tasks.extend(
                sweeper.start(Box::new(IntervalTicker::from_millis(self.config.sweep.interval_ms))),
            );
        }
        if let Some(settlement) = &self.settlement {
            tasks.extend(settlement.start(Box::new(IntervalTicker::from_millis(
                self.config.settlement.interval_ms,
            ))));
        }
        info!(
            watchers = self.watchers.len(),
            tasks = tasks.len(),
            "Custody service started"
        );
    }

    /// Flip every running flag and wait for the loops to leave. Loops still
    /// inside a tick after the grace period are aborted.
    pub async fn shutdown(&self) {
        for watcher in &self.watchers {
            watcher.stop();
        }
        self.reorg.stop();
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop();
        }
        if let Some(settlement) = &self.settlement {
            settlement.stop();
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Custody service stopped");
    }

    pub fn watcher(&self, chain: Chain) -> Option<Arc<ChainWatcher>> {
        self.watchers.iter().find(|w| w.chain() == chain).cloned()
    }

    fn allocator(&self) -> Result<&AddressAllocator, CustodyError> {
        self.allocator.as_ref().ok_or_else(|| {
            CustodyError::ConfigurationMissing("master seed not configured".to_string())
        })
    }

    fn sweeper(&self) -> Result<&SweepEngine, CustodyError> {
        self.sweeper.as_deref().ok_or_else(|| {
            CustodyError::ConfigurationMissing("sweeps need a master seed".to_string())
        })
    }

    fn settlement(&self) -> Result<&SettlementQueue, CustodyError> {
        self.settlement.as_deref().ok_or_else(|| {
            CustodyError::ConfigurationMissing("payouts need a master seed".to_string())
        })
    }

    pub async fn get_deposit_address(
        &self,
        user_id: UserId,
        chain: Chain,
    ) -> Result<AllocatedAddress, CustodyError> {
        self.allocator()?.get_deposit_address(user_id, chain).await
    }

    pub async fn get_user_deposit_addresses(
        &self,
        user_id: UserId,
    ) -> Result<Vec<DepositAddress>, CustodyError> {
        Ok(self.ledger.user_addresses(user_id).await?)
    }

    /// Align every EVM-family row of the user with their earliest EVM address
    pub async fn repair_evm_addresses(&self, user_id: UserId) -> Result<usize, CustodyError> {
        self.allocator()?
            .ensure_evm_address_consistency(user_id)
            .await
    }

    pub async fn trigger_manual_sweep(&self, chain: Chain) -> Result<SweepReport, CustodyError> {
        self.sweeper()?.trigger_manual_sweep(chain).await
    }

    pub async fn retry_failed_sweeps(&self, chain: Chain) -> Result<u64, CustodyError> {
        self.sweeper()?.retry_failed_sweeps(chain).await
    }

    pub async fn create_due_payouts(&self) -> Result<CreationReport, CustodyError> {
        self.settlement()?.create_due_payouts().await
    }

    pub async fn process_payout_queue(&self, limit: usize) -> Result<PayoutRunReport, CustodyError> {
        self.settlement()?.process_payout_queue(limit).await
    }

    pub async fn migrate_settlement(
        &self,
        token_address: &str,
        chain: Chain,
    ) -> Result<u64, CustodyError> {
        self.settlement()?
            .migrate_settlement(token_address, chain)
            .await
    }

    pub async fn run_reorg_check(&self) -> Result<ReorgReport, CustodyError> {
        self.reorg.run_check().await
    }

    pub fn get_reorg_checker_health(&self) -> ReorgHealth {
        self.reorg.health()
    }

    pub async fn get_deposit_stats(&self) -> Result<DepositStats, CustodyError> {
        Ok(self.ledger.deposit_stats().await?)
    }

    pub async fn get_sweep_stats(&self) -> Result<SweepStats, CustodyError> {
        Ok(self.ledger.sweep_stats().await?)
    }
}
