//! Payout creation for due participants

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{SettlementQueue, resolve_asset};
use crate::core_types::ChainFamily;
use crate::error::CustodyError;
use crate::ledger::{NewPayout, Participant, SettlementConfig, UserWallet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreationReport {
    pub due: usize,
    pub created: usize,
    /// Missing wallet/price or a zero amount; error recorded on the participant
    pub skipped: usize,
    pub duplicates: usize,
}

impl SettlementQueue {
    /// Create PENDING payouts for participants whose payout time has passed.
    /// Needs an active settlement config; without one nothing is created.
    pub async fn create_due_payouts(&self) -> Result<CreationReport, CustodyError> {
        let settlement = self.ledger.active_settlement_config().await?.ok_or_else(|| {
            CustodyError::ConfigurationMissing("no active settlement config".to_string())
        })?;
        let adapter = self.chains.get(settlement.chain).ok_or_else(|| {
            CustodyError::ConfigurationMissing(format!("no adapter for {}", settlement.chain))
        })?;
        let asset =
            resolve_asset(adapter.config(), &settlement.token_address).ok_or_else(|| {
                CustodyError::ConfigurationMissing(format!(
                    "settlement token {} not configured on {}",
                    settlement.token_address, settlement.chain
                ))
            })?;

        let now = self.clock.now();
        let due = self
            .ledger
            .due_participants(now, self.config.batch_limit)
            .await?;
        let mut report = CreationReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        // one price for the whole run
        let price = self
            .oracle
            .unit_price(&settlement.token_symbol, settlement.chain)
            .await;

        for participant in &due {
            if self.ledger.payout_exists(participant.id).await? {
                report.duplicates += 1;
                continue;
            }
            let wallets = self.ledger.user_wallets(participant.user_id).await?;
            let Some(wallet) = self.pick_wallet(&wallets, settlement.chain.family()) else {
                self.skip(participant, "no wallet for settlement chain", &mut report)
                    .await?;
                continue;
            };
            let Some(price) = price else {
                self.skip(
                    participant,
                    &format!("no price for {}", settlement.token_symbol),
                    &mut report,
                )
                .await?;
                continue;
            };
            let amount = token_amount(participant.payout_usd, price, asset.decimals);
            if amount <= Decimal::ZERO {
                self.skip(participant, "payout rounds to zero", &mut report)
                    .await?;
                continue;
            }

            match self
                .ledger
                .insert_payout(new_payout(participant, wallet, &settlement, amount, now))
                .await?
            {
                Some(payout) => {
                    info!(
                        payout_id = payout.id,
                        participant_id = participant.id,
                        user_id = participant.user_id,
                        amount = %amount,
                        amount_usd = %participant.payout_usd,
                        token = %settlement.token_symbol,
                        "Payout created"
                    );
                    report.created += 1;
                }
                None => report.duplicates += 1,
            }
        }
        Ok(report)
    }

    /// Preferred wallet type first, then the fallback; family must match
    fn pick_wallet<'a>(
        &self,
        wallets: &'a [UserWallet],
        family: ChainFamily,
    ) -> Option<&'a UserWallet> {
        [
            &self.config.preferred_wallet_type,
            &self.config.fallback_wallet_type,
        ]
        .into_iter()
        .find_map(|kind| {
            wallets
                .iter()
                .find(|w| w.family == family && w.wallet_type.eq_ignore_ascii_case(kind))
        })
    }

    async fn skip(
        &self,
        participant: &Participant,
        reason: &str,
        report: &mut CreationReport,
    ) -> Result<(), CustodyError> {
        warn!(
            participant_id = participant.id,
            user_id = participant.user_id,
            reason,
            "Payout not created"
        );
        self.ledger
            .record_payout_error(participant.id, reason, self.clock.now())
            .await?;
        report.skipped += 1;
        Ok(())
    }
}

/// USD / unit price, rounded down to the token's decimals
fn token_amount(usd: Decimal, price: Decimal, decimals: u32) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let amount = (usd / price).round_dp_with_strategy(decimals, RoundingStrategy::ToZero);
    debug!(usd = %usd, price = %price, amount = %amount, "Payout amount");
    amount
}

fn new_payout(
    participant: &Participant,
    wallet: &UserWallet,
    settlement: &SettlementConfig,
    amount: Decimal,
    now: chrono::DateTime<chrono::Utc>,
) -> NewPayout {
    NewPayout {
        participant_id: participant.id,
        user_id: participant.user_id,
        trench_id: participant.trench_id,
        amount,
        amount_usd: participant.payout_usd,
        to_address: wallet.address.clone(),
        token_address: settlement.token_address.clone(),
        chain: settlement.chain,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::chain::ChainRegistry;
    use crate::chain::mock::{MockChain, mock_config};
    use crate::config::SettlementQueueConfig;
    use crate::core_types::Chain;
    use crate::ledger::{MemoryLedger, PayoutStatus, SettlementStore};
    use crate::oracle::StaticPriceOracle;
    use crate::scheduler::ManualClock;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn queue(ledger: Arc<MemoryLedger>, price: Option<Decimal>) -> SettlementQueue {
        let mut registry = ChainRegistry::new();
        registry.insert(Arc::new(MockChain::new(mock_config(Chain::Base))));
        let mut oracle = StaticPriceOracle::default();
        if let Some(p) = price {
            oracle.set("USDC", p);
        }
        ledger.set_settlement_config(SettlementConfig {
            token_symbol: "USDC".to_string(),
            token_address: "0xusdc".to_string(),
            chain: Chain::Base,
            paused: false,
        });
        SettlementQueue::new(
            registry,
            ledger,
            Arc::new(oracle),
            Arc::new(RecordingAlerter::default()),
            Arc::new(ManualClock::new(Utc::now())),
            SettlementQueueConfig::default(),
        )
    }

    fn participant(id: i64, usd: i64) -> Participant {
        Participant {
            id,
            user_id: id,
            trench_id: 3,
            payout_usd: Decimal::new(usd, 0),
            expected_payout_at: Utc::now() - ChronoDuration::hours(1),
        }
    }

    fn wallet(user_id: i64, kind: &str, family: ChainFamily, address: &str) -> UserWallet {
        UserWallet {
            user_id,
            wallet_type: kind.to_string(),
            family,
            address: address.to_string(),
        }
    }

    #[test]
    fn test_token_amount_rounds_down() {
        assert_eq!(
            token_amount(Decimal::new(100, 0), Decimal::new(3, 0), 6),
            Decimal::new(33_333_333, 6)
        );
        assert_eq!(
            token_amount(Decimal::ONE, Decimal::ZERO, 6),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_create_prefers_wallet_type_and_is_idempotent() {
        let ledger = Arc::new(MemoryLedger::new());
        let q = queue(ledger.clone(), Some(Decimal::new(2, 0)));
        ledger.add_participant(participant(1, 100));
        ledger.add_wallet(wallet(1, "embedded", ChainFamily::Evm, "0xembedded"));
        ledger.add_wallet(wallet(1, "external", ChainFamily::Solana, "SoLwallet"));
        ledger.add_wallet(wallet(1, "external", ChainFamily::Evm, "0xexternal"));

        let report = q.create_due_payouts().await.unwrap();
        assert_eq!(report.created, 1);
        let payouts = ledger.pending_payouts(10).await.unwrap();
        assert_eq!(payouts[0].to_address, "0xexternal");
        assert_eq!(payouts[0].amount, Decimal::new(50, 0));
        assert_eq!(payouts[0].status, PayoutStatus::Pending);

        let report = q.create_due_payouts().await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(ledger.pending_payouts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_wallet_used() {
        let ledger = Arc::new(MemoryLedger::new());
        let q = queue(ledger.clone(), Some(Decimal::ONE));
        ledger.add_participant(participant(1, 20));
        ledger.add_wallet(wallet(1, "embedded", ChainFamily::Evm, "0xembedded"));
        q.create_due_payouts().await.unwrap();
        assert_eq!(
            ledger.pending_payouts(10).await.unwrap()[0].to_address,
            "0xembedded"
        );
    }

    #[tokio::test]
    async fn test_missing_wallet_or_price_records_error() {
        let ledger = Arc::new(MemoryLedger::new());
        let q = queue(ledger.clone(), None);
        ledger.add_participant(participant(1, 20));
        ledger.add_participant(participant(2, 20));
        ledger.add_wallet(wallet(2, "external", ChainFamily::Evm, "0xuser2"));

        let report = q.create_due_payouts().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert!(ledger.participant_error(1).unwrap().contains("wallet"));
        assert!(ledger.participant_error(2).unwrap().contains("price"));
        assert!(ledger.pending_payouts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_participants_do_not_starve_ready_ones() {
        let ledger = Arc::new(MemoryLedger::new());
        let q = queue(ledger.clone(), Some(Decimal::ONE));
        // a full batch of older participants that never have a wallet
        for id in 1..=20 {
            ledger.add_participant(participant(id, 20));
        }
        let mut ready = participant(21, 20);
        ready.expected_payout_at = Utc::now() - ChronoDuration::minutes(30);
        ledger.add_participant(ready);
        ledger.add_wallet(wallet(21, "external", ChainFamily::Evm, "0xready"));

        let first = q.create_due_payouts().await.unwrap();
        assert_eq!((first.due, first.skipped, first.created), (20, 20, 0));

        let second = q.create_due_payouts().await.unwrap();
        assert_eq!(second.created, 1);
        let payouts = ledger.pending_payouts(10).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].participant_id, 21);
    }

    #[tokio::test]
    async fn test_not_yet_due_ignored() {
        let ledger = Arc::new(MemoryLedger::new());
        let q = queue(ledger.clone(), Some(Decimal::ONE));
        let mut p = participant(1, 20);
        p.expected_payout_at = Utc::now() + ChronoDuration::days(1);
        ledger.add_participant(p);
        ledger.add_wallet(wallet(1, "external", ChainFamily::Evm, "0xuser"));
        let report = q.create_due_payouts().await.unwrap();
        assert_eq!(report.due, 0);
    }
}
