//! Reorg Guard
//!
//! Periodically re-verifies recorded chain state.
//!
//! Primary pass: pre-credit deposits are re-checked against the canonical
//! chain; a changed block hash or vanished transaction marks them REORGED
//! with a DETECTED_BEFORE_CREDIT incident. No balance was touched yet.
//!
//! Secondary pass: deposits credited within the trailing window are
//! re-checked too. A reorged credit is reversed atomically only when the
//! user has not spent since the credit and still holds the amount;
//! everything else becomes a REQUIRES_REVIEW incident for an operator.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEvent, AlertKind, Alerter};
use crate::chain::{CanonicalStatus, ChainRegistry};
use crate::config::ReorgConfig;
use crate::error::CustodyError;
use crate::ledger::{
    Deposit, DepositStatus, IncidentStatus, LedgerStore, NewIncident, ReversalOutcome,
};
use crate::scheduler::{Clock, Ticker};

/// Unhealthy when no check finished within this many intervals
const HEALTH_INTERVALS: i64 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReorgReport {
    pub checked_pre_credit: usize,
    pub checked_credited: usize,
    pub reorged_before_credit: usize,
    pub reversed: usize,
    pub requires_review: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReorgHealth {
    pub healthy: bool,
    pub running: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub pre_credit_monitored: usize,
    pub credited_monitored: usize,
}

#[derive(Debug, Default)]
struct HealthState {
    last_check: Option<DateTime<Utc>>,
    pre_credit_monitored: usize,
    credited_monitored: usize,
}

pub struct ReorgGuard {
    chains: ChainRegistry,
    ledger: Arc<dyn LedgerStore>,
    alerter: Arc<dyn Alerter>,
    clock: Arc<dyn Clock>,
    config: ReorgConfig,
    running: AtomicBool,
    health: Mutex<HealthState>,
}

impl ReorgGuard {
    pub fn new(
        chains: ChainRegistry,
        ledger: Arc<dyn LedgerStore>,
        alerter: Arc<dyn Alerter>,
        clock: Arc<dyn Clock>,
        config: ReorgConfig,
    ) -> Self {
        Self {
            chains,
            ledger,
            alerter,
            clock,
            config,
            running: AtomicBool::new(false),
            health: Mutex::new(HealthState::default()),
        }
    }

    fn health_state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(self: &Arc<Self>, mut ticker: Box<dyn Ticker>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        info!(
            interval_ms = self.config.interval_ms,
            window_secs = self.config.credited_window_secs,
            "Reorg guard started"
        );
        let guard = Arc::clone(self);
        Some(tokio::spawn(async move {
            while guard.running.load(Ordering::Acquire) && ticker.tick().await {
                if !guard.running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = guard.run_check().await {
                    error!(error = %e, code = e.code(), "Reorg check failed");
                }
            }
            guard.running.store(false, Ordering::Release);
            info!("Reorg guard stopped");
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn health(&self) -> ReorgHealth {
        let st = self.health_state();
        let limit = ChronoDuration::milliseconds(self.config.interval_ms as i64 * HEALTH_INTERVALS);
        let healthy = st
            .last_check
            .is_some_and(|t| self.clock.now() - t <= limit);
        ReorgHealth {
            healthy,
            running: self.running.load(Ordering::Acquire),
            last_check: st.last_check,
            pre_credit_monitored: st.pre_credit_monitored,
            credited_monitored: st.credited_monitored,
        }
    }

    /// One full check: primary then secondary pass
    pub async fn run_check(&self) -> Result<ReorgReport, CustodyError> {
        let now = self.clock.now();
        let mut report = ReorgReport::default();

        let pre_credit = self
            .ledger
            .deposits_in_status(None, &DepositStatus::PRE_CREDIT)
            .await?;
        report.checked_pre_credit = pre_credit.len();
        for deposit in &pre_credit {
            match self.check_pre_credit(deposit, now).await {
                Ok(true) => report.reorged_before_credit += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(deposit_id = deposit.id, error = %e, "Pre-credit reorg check failed");
                }
            }
        }

        let since = now - ChronoDuration::seconds(self.config.credited_window_secs);
        let credited = self.ledger.credited_deposits_since(since).await?;
        report.checked_credited = credited.len();
        for deposit in &credited {
            match self.check_credited(deposit, now).await {
                Ok(Some(IncidentStatus::Reversed)) => report.reversed += 1,
                Ok(Some(IncidentStatus::RequiresReview)) => report.requires_review += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(deposit_id = deposit.id, error = %e, "Credited reorg check failed");
                }
            }
        }

        {
            let mut st = self.health_state();
            st.last_check = Some(now);
            st.pre_credit_monitored = report.checked_pre_credit;
            st.credited_monitored = report.checked_credited;
        }
        if report.reorged_before_credit + report.reversed + report.requires_review > 0 {
            warn!(
                reorged_before_credit = report.reorged_before_credit,
                reversed = report.reversed,
                requires_review = report.requires_review,
                "Reorg check found invalidated deposits"
            );
        } else {
            debug!(
                pre_credit = report.checked_pre_credit,
                credited = report.checked_credited,
                "Reorg check clean"
            );
        }
        Ok(report)
    }

    async fn canonical_status(&self, deposit: &Deposit) -> Result<CanonicalStatus, CustodyError> {
        let Some(adapter) = self.chains.get(deposit.chain) else {
            return Err(CustodyError::ConfigurationMissing(format!(
                "no adapter for {}",
                deposit.chain
            )));
        };
        Ok(adapter.verify_block_still_canonical(deposit).await?)
    }

    async fn check_pre_credit(
        &self,
        deposit: &Deposit,
        now: DateTime<Utc>,
    ) -> Result<bool, CustodyError> {
        let CanonicalStatus::Reorged(reason) = self.canonical_status(deposit).await? else {
            return Ok(false);
        };
        let Some(incident) = self
            .ledger
            .mark_reorged_before_credit(deposit.id, &reason, now)
            .await?
        else {
            // credited or reorged meanwhile; the secondary pass owns it now
            return Ok(false);
        };

        warn!(
            chain = %deposit.chain,
            deposit_id = deposit.id,
            tx_hash = %deposit.tx_hash,
            reason = %reason,
            "Deposit reorged before credit"
        );
        self.alerter
            .alert(AlertEvent::new(
                AlertKind::ReorgBeforeCredit {
                    deposit_id: deposit.id,
                    user_id: incident.user_id,
                    chain: deposit.chain,
                    tx_hash: deposit.tx_hash.clone(),
                    reason,
                },
                now,
            ))
            .await;
        Ok(true)
    }

    async fn check_credited(
        &self,
        deposit: &Deposit,
        now: DateTime<Utc>,
    ) -> Result<Option<IncidentStatus>, CustodyError> {
        let CanonicalStatus::Reorged(reason) = self.canonical_status(deposit).await? else {
            return Ok(None);
        };
        let already_flagged = self
            .ledger
            .incidents_for_deposit(deposit.id)
            .await?
            .iter()
            .any(|i| i.status == IncidentStatus::RequiresReview);
        if already_flagged {
            debug!(deposit_id = deposit.id, "Reorged deposit already awaiting review");
            return Ok(None);
        }

        let amount = deposit.amount_usd.unwrap_or(Decimal::ZERO);
        if deposit.status == DepositStatus::Swept {
            let why = format!("{}; funds already swept", reason);
            return self.require_review(deposit, amount, why, now).await;
        }
        if let Some(batch_id) = deposit.sweep_batch_id {
            let why = format!("{}; sweep batch {} in progress", reason, batch_id);
            return self.require_review(deposit, amount, why, now).await;
        }

        let safe_at = deposit.safe_at.unwrap_or(deposit.detected_at);
        let spent = self.ledger.spends_since(deposit.user_id, safe_at).await?;
        if spent > Decimal::ZERO {
            let why = format!("{}; user spent {} since credit", reason, spent);
            return self.require_review(deposit, amount, why, now).await;
        }
        let balance = self.ledger.user_balance(deposit.user_id).await?;
        if balance < amount {
            let why = format!("{}; balance {} below deposit {}", reason, balance, amount);
            return self.require_review(deposit, amount, why, now).await;
        }

        match self
            .ledger
            .reverse_credited_deposit(deposit.id, &reason, now)
            .await?
        {
            ReversalOutcome::Reversed(_) => {
                warn!(
                    chain = %deposit.chain,
                    deposit_id = deposit.id,
                    user_id = deposit.user_id,
                    amount_usd = %amount,
                    "Reversed credited deposit after reorg"
                );
                self.alerter
                    .alert(AlertEvent::new(
                        AlertKind::ReorgReversed {
                            deposit_id: deposit.id,
                            user_id: deposit.user_id,
                            chain: deposit.chain,
                            amount_usd: amount,
                        },
                        now,
                    ))
                    .await;
                Ok(Some(IncidentStatus::Reversed))
            }
            ReversalOutcome::InsufficientBalance { balance } => {
                let why = format!("{}; balance {} below deposit {}", reason, balance, amount);
                self.require_review(deposit, amount, why, now).await
            }
            ReversalOutcome::LinkedToSweep(batch_id) => {
                let why = format!("{}; sweep batch {} in progress", reason, batch_id);
                self.require_review(deposit, amount, why, now).await
            }
            ReversalOutcome::NotReversible(DepositStatus::Swept) => {
                let why = format!("{}; funds already swept", reason);
                self.require_review(deposit, amount, why, now).await
            }
            ReversalOutcome::NotReversible(status) => {
                debug!(deposit_id = deposit.id, status = %status, "Deposit no longer reversible");
                Ok(None)
            }
        }
    }

    async fn require_review(
        &self,
        deposit: &Deposit,
        amount: Decimal,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Option<IncidentStatus>, CustodyError> {
        self.ledger
            .record_incident(NewIncident {
                deposit_id: deposit.id,
                user_id: deposit.user_id,
                amount,
                status: IncidentStatus::RequiresReview,
                reason: reason.clone(),
                detected_at: now,
            })
            .await?;
        error!(
            chain = %deposit.chain,
            deposit_id = deposit.id,
            user_id = deposit.user_id,
            reason = %reason,
            "Reorged credit requires manual review"
        );
        self.alerter
            .alert(AlertEvent::new(
                AlertKind::ReorgRequiresReview {
                    deposit_id: deposit.id,
                    user_id: deposit.user_id,
                    chain: deposit.chain,
                    amount_usd: amount,
                    reason,
                },
                now,
            ))
            .await;
        Ok(Some(IncidentStatus::RequiresReview))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::chain::mock::{MockChain, mock_config};
    use crate::core_types::Chain;
    use crate::ledger::{DepositStore, MemoryLedger};
    use crate::scheduler::ManualClock;

    struct Fixture {
        chain: Arc<MockChain>,
        ledger: Arc<MemoryLedger>,
        alerts: Arc<RecordingAlerter>,
        clock: Arc<ManualClock>,
        guard: ReorgGuard,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MockChain::new(mock_config(Chain::Base)));
        let mut registry = ChainRegistry::new();
        registry.insert(chain.clone());
        let ledger = Arc::new(MemoryLedger::new());
        let alerts = Arc::new(RecordingAlerter::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = ReorgGuard::new(
            registry,
            ledger.clone(),
            alerts.clone(),
            clock.clone(),
            ReorgConfig::default(),
        );
        Fixture {
            chain,
            ledger,
            alerts,
            clock,
            guard,
        }
    }

    fn deposit(id: i64, status: DepositStatus, block: u64, now: DateTime<Utc>) -> Deposit {
        let credited = status.is_credited();
        Deposit {
            id,
            deposit_address_id: 1,
            user_id: 7,
            chain: Chain::Base,
            asset: "USDC".to_string(),
            amount: Decimal::new(50, 0),
            amount_usd: Some(Decimal::new(50, 0)),
            tx_hash: format!("0x{}", id),
            block_number: Some(block),
            block_hash: Some(MockChain::block_hash(block)),
            confirmations: if credited { 3 } else { 1 },
            status,
            sweep_batch_id: None,
            sweep_tx_hash: None,
            detected_at: now,
            confirmed_at: credited.then_some(now),
            safe_at: credited.then_some(now),
            swept_at: None,
        }
    }

    #[tokio::test]
    async fn test_pre_credit_reorg_marks_reorged_without_balance_change() {
        let f = fixture();
        let now = f.clock.now();
        f.ledger.set_balance(7, Decimal::new(10, 0));
        f.ledger
            .put_deposit(deposit(1, DepositStatus::Confirming, 95, now));
        f.chain.reorg_block(95);

        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.reorged_before_credit, 1);
        let d = f.ledger.deposit(1).await.unwrap().unwrap();
        assert_eq!(d.status, DepositStatus::Reorged);
        assert_eq!(f.ledger.user_balance(7).await.unwrap(), Decimal::new(10, 0));
        let incidents = f.ledger.incidents_for_deposit(1).await.unwrap();
        assert_eq!(incidents[0].status, IncidentStatus::DetectedBeforeCredit);
        assert!(matches!(
            f.alerts.kinds()[0],
            AlertKind::ReorgBeforeCredit { deposit_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_credited_reorg_reversed_once() {
        let f = fixture();
        let now = f.clock.now();
        f.ledger.set_balance(7, Decimal::new(80, 0));
        f.ledger
            .put_deposit(deposit(2, DepositStatus::Confirmed, 90, now));
        f.chain.reorg_block(90);

        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.reversed, 1);
        assert_eq!(f.ledger.user_balance(7).await.unwrap(), Decimal::new(30, 0));

        // second pass: deposit is REORGED, not credited, nothing to do
        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.reversed, 0);
        assert_eq!(f.ledger.user_balance(7).await.unwrap(), Decimal::new(30, 0));
        let incidents = f.ledger.incidents_for_deposit(2).await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, IncidentStatus::Reversed);
    }

    #[tokio::test]
    async fn test_spent_credit_requires_review() {
        let f = fixture();
        let now = f.clock.now();
        f.ledger.set_balance(7, Decimal::new(50, 0));
        f.ledger
            .put_deposit(deposit(3, DepositStatus::Confirmed, 90, now));
        f.ledger
            .record_spend(7, Decimal::new(50, 0), now + ChronoDuration::seconds(10));
        f.chain.reorg_block(90);

        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.requires_review, 1);
        assert_eq!(f.ledger.user_balance(7).await.unwrap(), Decimal::ZERO);
        assert_eq!(
            f.ledger.deposit(3).await.unwrap().unwrap().status,
            DepositStatus::Confirmed
        );

        // not re-flagged on the next pass
        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.requires_review, 0);
        assert_eq!(f.ledger.incidents_for_deposit(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_swept_credit_requires_review() {
        let f = fixture();
        let now = f.clock.now();
        f.ledger.set_balance(7, Decimal::new(100, 0));
        f.ledger.put_deposit(deposit(4, DepositStatus::Swept, 90, now));
        f.chain.reorg_block(90);

        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.requires_review, 1);
        assert_eq!(f.ledger.user_balance(7).await.unwrap(), Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_credit_in_sweep_batch_requires_review() {
        let f = fixture();
        let now = f.clock.now();
        f.ledger.set_balance(7, Decimal::new(100, 0));
        let mut linked = deposit(6, DepositStatus::Confirmed, 90, now);
        linked.sweep_batch_id = Some(77);
        f.ledger.put_deposit(linked);
        f.chain.reorg_block(90);

        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.reversed, 0);
        assert_eq!(report.requires_review, 1);
        assert_eq!(f.ledger.user_balance(7).await.unwrap(), Decimal::new(100, 0));
        let d = f.ledger.deposit(6).await.unwrap().unwrap();
        assert_eq!(d.status, DepositStatus::Confirmed);
        let incidents = f.ledger.incidents_for_deposit(6).await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, IncidentStatus::RequiresReview);
        assert!(incidents[0].reason.contains("sweep batch 77"));
    }

    #[tokio::test]
    async fn test_outside_window_not_checked() {
        let f = fixture();
        let now = f.clock.now();
        f.ledger
            .put_deposit(deposit(5, DepositStatus::Confirmed, 90, now));
        f.clock.advance(ChronoDuration::hours(2));
        f.chain.reorg_block(90);

        let report = f.guard.run_check().await.unwrap();
        assert_eq!(report.checked_credited, 0);
    }

    #[tokio::test]
    async fn test_health_goes_stale() {
        let f = fixture();
        assert!(!f.guard.health().healthy);
        f.guard.run_check().await.unwrap();
        assert!(f.guard.health().healthy);
        f.clock.advance(ChronoDuration::minutes(5));
        assert!(!f.guard.health().healthy);
    }
}
