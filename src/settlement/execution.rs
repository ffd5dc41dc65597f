//! Payout execution
//!
//! A claimed payout ends CONFIRMED or FAILED, or goes back to PENDING when
//! the failure happened before anything could reach the network. A claim
//! whose outcome never made it to the ledger is failed and alerted once it
//! has been EXECUTING for `stuck_payout_secs`; it is never re-sent.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{SettlementQueue, resolve_asset};
use crate::alert::{AlertEvent, AlertKind};
use crate::chain::PayoutOutcome;
use crate::error::CustodyError;
use crate::ledger::{Payout, PayoutStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutRunReport {
    pub paused: bool,
    pub processed: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Released back to PENDING after a transient pre-send error
    pub deferred: usize,
    /// Claimed by an overlapping run first
    pub claimed_elsewhere: usize,
    /// EXECUTING claims past `stuck_payout_secs`, now FAILED
    pub stuck: usize,
}

enum Settled {
    Confirmed(String),
    Failed {
        reason: String,
        tx_hash: Option<String>,
        alert: AlertKind,
    },
    /// Nothing was sent; run again later
    Retry(String),
}

impl SettlementQueue {
    /// Execute up to `limit` PENDING payouts, oldest first. Nothing runs while
    /// the local or the ledger's settlement config is paused.
    pub async fn process_payout_queue(&self, limit: usize) -> Result<PayoutRunReport, CustodyError> {
        let mut report = PayoutRunReport {
            stuck: self.fail_stuck_payouts(limit).await?,
            ..Default::default()
        };
        if self.is_paused().await? {
            info!("Settlement paused, payout queue not processed");
            report.paused = true;
            return Ok(report);
        }

        let pending = self.ledger.pending_payouts(limit).await?;
        let delay = Duration::from_millis(self.config.inter_payout_delay_ms);
        for (i, payout) in pending.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.ledger.claim_payout(payout.id, self.clock.now()).await? {
                debug!(payout_id = payout.id, "Payout claimed by another run");
                report.claimed_elsewhere += 1;
                continue;
            }
            report.processed += 1;

            match self.settle(payout).await {
                Settled::Confirmed(tx_id) => {
                    let recorded = self
                        .record_outcome(payout, PayoutStatus::Confirmed, Some(tx_id.clone()), None)
                        .await;
                    if recorded {
                        info!(
                            payout_id = payout.id,
                            chain = %payout.chain,
                            amount = %payout.amount,
                            tx_id = %tx_id,
                            "Payout confirmed"
                        );
                    }
                    report.confirmed += 1;
                }
                Settled::Failed {
                    reason,
                    tx_hash,
                    alert,
                } => {
                    error!(
                        payout_id = payout.id,
                        chain = %payout.chain,
                        tx_hash = ?tx_hash,
                        reason = %reason,
                        "Payout failed"
                    );
                    self.record_outcome(payout, PayoutStatus::Failed, tx_hash, Some(reason))
                        .await;
                    self.alerter
                        .alert(AlertEvent::new(alert, self.clock.now()))
                        .await;
                    report.failed += 1;
                }
                Settled::Retry(reason) => {
                    warn!(
                        payout_id = payout.id,
                        chain = %payout.chain,
                        reason = %reason,
                        "Payout not sent, returned to queue"
                    );
                    match self.ledger.release_payout(payout.id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(payout_id = payout.id, "Payout left EXECUTING before release");
                        }
                        Err(e) => {
                            error!(payout_id = payout.id, error = %e, "Failed to release payout claim");
                        }
                    }
                    report.deferred += 1;
                }
            }
        }
        if report.processed > 0 {
            info!(
                processed = report.processed,
                confirmed = report.confirmed,
                failed = report.failed,
                deferred = report.deferred,
                "Payout run finished"
            );
        }
        Ok(report)
    }

    /// Persist a terminal status. A ledger error leaves the row EXECUTING;
    /// it is alerted here and picked up later by the stuck-claim pass.
    async fn record_outcome(
        &self,
        payout: &Payout,
        status: PayoutStatus,
        tx_hash: Option<String>,
        reason: Option<String>,
    ) -> bool {
        let Err(e) = self
            .ledger
            .complete_payout(payout.id, status, tx_hash.clone(), reason, self.clock.now())
            .await
        else {
            return true;
        };
        error!(
            payout_id = payout.id,
            chain = %payout.chain,
            status = %status,
            tx_hash = ?tx_hash,
            error = %e,
            "Payout outcome not recorded"
        );
        self.alerter
            .alert(AlertEvent::new(
                AlertKind::PayoutStuck {
                    payout_id: payout.id,
                    chain: payout.chain,
                    reason: format!("{} outcome not recorded: {}", status, e),
                    tx_hash,
                },
                self.clock.now(),
            ))
            .await;
        false
    }

    /// Fail EXECUTING claims older than `stuck_payout_secs`. They may have
    /// been broadcast, so they are alerted for manual follow-up instead of
    /// returning to PENDING.
    async fn fail_stuck_payouts(&self, limit: usize) -> Result<usize, CustodyError> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::seconds(self.config.stuck_payout_secs as i64);
        let stuck = self.ledger.stale_executing_payouts(cutoff, limit).await?;
        let mut failed = 0;
        for payout in stuck {
            let reason = format!(
                "stuck in EXECUTING since {}; verify on chain before retrying",
                payout
                    .claimed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            error!(
                payout_id = payout.id,
                chain = %payout.chain,
                tx_hash = ?payout.tx_hash,
                "Payout stuck in EXECUTING"
            );
            if let Err(e) = self
                .ledger
                .complete_payout(payout.id, PayoutStatus::Failed, None, Some(reason.clone()), now)
                .await
            {
                error!(payout_id = payout.id, error = %e, "Failed to mark stuck payout");
                continue;
            }
            self.alerter
                .alert(AlertEvent::new(
                    AlertKind::PayoutStuck {
                        payout_id: payout.id,
                        chain: payout.chain,
                        reason,
                        tx_hash: payout.tx_hash.clone(),
                    },
                    now,
                ))
                .await;
            failed += 1;
        }
        Ok(failed)
    }

    async fn is_paused(&self) -> Result<bool, CustodyError> {
        if self.config.paused {
            return Ok(true);
        }
        Ok(self
            .ledger
            .active_settlement_config()
            .await?
            .is_some_and(|c| c.paused))
    }

    /// Run one claimed payout to an outcome
    async fn settle(&self, payout: &Payout) -> Settled {
        let failed = |reason: String, tx_hash: Option<String>| Settled::Failed {
            alert: AlertKind::PayoutFailed {
                payout_id: payout.id,
                chain: payout.chain,
                reason: reason.clone(),
                tx_hash: tx_hash.clone(),
            },
            reason,
            tx_hash,
        };

        let Some(adapter) = self.chains.get(payout.chain) else {
            return failed(format!("no adapter for {}", payout.chain), None);
        };
        let Some(asset) = resolve_asset(adapter.config(), &payout.token_address) else {
            return failed(
                format!(
                    "token {} not configured on {}",
                    payout.token_address, payout.chain
                ),
                None,
            );
        };

        let timeout = Duration::from_secs(self.config.confirmation_timeout_secs);
        match adapter
            .execute_payout(&payout.to_address, &asset, payout.amount, timeout)
            .await
        {
            Ok(PayoutOutcome::Confirmed { tx_id }) => Settled::Confirmed(tx_id),
            Ok(PayoutOutcome::Reverted { tx_id }) => {
                failed("transaction reverted".to_string(), Some(tx_id))
            }
            Ok(PayoutOutcome::TimedOut { tx_id }) => {
                warn!(payout_id = payout.id, tx_id = %tx_id, "Payout confirmation timed out");
                failed(
                    format!("not confirmed within {}s", timeout.as_secs()),
                    Some(tx_id),
                )
            }
            Ok(PayoutOutcome::SendUnknown { error }) => failed(
                format!("send timed out, broadcast unknown: {}", error),
                None,
            ),
            Err(e) => match CustodyError::from(e) {
                CustodyError::InsufficientFunds {
                    required,
                    available,
                    shortfall,
                } => Settled::Failed {
                    reason: format!(
                        "insufficient vault balance: required {}, available {}, shortfall {}",
                        required, available, shortfall
                    ),
                    tx_hash: None,
                    alert: AlertKind::PayoutInsufficientFunds {
                        payout_id: payout.id,
                        chain: payout.chain,
                        token_address: payout.token_address.clone(),
                        required,
                        available,
                        shortfall,
                    },
                },
                other if other.is_transient() => Settled::Retry(other.to_string()),
                other => failed(other.to_string(), None),
            },
        }
    }
}
