//! Confirmation Monitor
//!
//! Tracks confirmation counts for pre-credit deposits and moves them
//! through the state machine:
//! PENDING -> CONFIRMING -> CONFIRMED
//!
//! Counts only ever rise. Reaching the chain's threshold (or a finality
//! signal) hands the deposit to the pipeline for crediting.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::pipeline::DepositPipeline;
use crate::chain::ChainAdapter;
use crate::error::CustodyError;
use crate::ledger::{DepositStatus, LedgerStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationReport {
    pub checked: usize,
    pub credited: usize,
    /// Reached the threshold but could not be credited yet (unpriced)
    pub deferred: usize,
}

pub struct ConfirmationMonitor {
    adapter: Arc<dyn ChainAdapter>,
    ledger: Arc<dyn LedgerStore>,
}

impl ConfirmationMonitor {
    pub fn new(adapter: Arc<dyn ChainAdapter>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { adapter, ledger }
    }

    /// Refresh confirmations for every pre-credit deposit on the chain and
    /// credit the ones that reached the threshold
    pub async fn update_confirmations(
        &self,
        pipeline: &DepositPipeline,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationReport, CustodyError> {
        let chain = self.adapter.chain();
        let pending = self
            .ledger
            .deposits_in_status(Some(chain), &DepositStatus::PRE_CREDIT)
            .await?;
        if pending.is_empty() {
            return Ok(ConfirmationReport::default());
        }
        debug!(chain = %chain, count = pending.len(), "Checking pending deposits");

        let threshold = self.adapter.config().confirmations;
        let updates = self.adapter.check_confirmations(&pending).await?;
        let by_id: HashMap<_, _> = pending.iter().map(|d| (d.id, d)).collect();

        let mut report = ConfirmationReport {
            checked: pending.len(),
            ..Default::default()
        };
        for update in updates {
            let Some(deposit) = by_id.get(&update.deposit_id) else {
                continue;
            };
            if update.confirmations > deposit.confirmations {
                match self
                    .ledger
                    .update_confirmations(deposit.id, update.confirmations)
                    .await
                {
                    // left pre-credit meanwhile (reorg guard)
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        warn!(deposit_id = deposit.id, error = %e, "Failed to update confirmations");
                        continue;
                    }
                }
            }
            if !update.reaches(threshold) {
                continue;
            }

            let confirmations = update.confirmations.max(deposit.confirmations);
            match pipeline.credit(deposit, confirmations, now).await {
                Ok(true) => report.credited += 1,
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    debug!(deposit_id = deposit.id, error = %e, "Credit deferred");
                    report.deferred += 1;
                }
                Err(e) => {
                    warn!(deposit_id = deposit.id, error = %e, "Failed to credit deposit");
                }
            }
        }
        Ok(report)
    }
}
