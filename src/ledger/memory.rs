//! In-memory ledger
//!
//! Same contract as the PostgreSQL store. One mutex guards all tables, so
//! every trait call is trivially atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::{
    AddressStore, DepositStore, LedgerError, LedgerResult, SettlementStore, SweepStore,
};
use crate::core_types::{
    Chain, ChainFamily, DepositAddressId, DepositId, DerivationIndex, ParticipantId, PayoutId,
    SweepBatchId, UserId,
};

#[derive(Default)]
struct State {
    next_id: i64,
    addresses: BTreeMap<DepositAddressId, DepositAddress>,
    deposits: BTreeMap<DepositId, Deposit>,
    batches: BTreeMap<SweepBatchId, SweepBatch>,
    incidents: Vec<ReorgIncident>,
    payouts: BTreeMap<PayoutId, Payout>,
    balances: HashMap<UserId, Decimal>,
    spends: Vec<(UserId, Decimal, DateTime<Utc>)>,
    waitlist: Vec<WaitlistEntry>,
    participants: Vec<Participant>,
    participant_errors: HashMap<ParticipantId, (String, DateTime<Utc>)>,
    wallets: Vec<UserWallet>,
    vaults: HashMap<Chain, String>,
    settlement: Option<SettlementConfig>,
    #[cfg(test)]
    fail_payout_completion: bool,
    #[cfg(test)]
    fail_deposit_inserts: bool,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn deposit_mut(&mut self, id: DepositId) -> LedgerResult<&mut Deposit> {
        self.deposits
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", id)))
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_vault(&self, chain: Chain, address: &str) {
        self.lock().vaults.insert(chain, address.to_string());
    }

    pub fn set_balance(&self, user_id: UserId, balance: Decimal) {
        self.lock().balances.insert(user_id, balance);
    }

    /// Debit a user and record the spend (what the campaign system does)
    pub fn record_spend(&self, user_id: UserId, amount: Decimal, at: DateTime<Utc>) {
        let mut st = self.lock();
        *st.balances.entry(user_id).or_default() -= amount;
        st.spends.push((user_id, amount, at));
    }

    pub fn add_waitlist_entry(&self, user_id: UserId, campaign_id: i64) -> i64 {
        let mut st = self.lock();
        let id = st.next_id();
        st.waitlist.push(WaitlistEntry {
            id,
            user_id,
            campaign_id,
            is_open: true,
            has_deposited: false,
            deposited_usd: Decimal::ZERO,
        });
        id
    }

    pub fn waitlist_entries(&self, user_id: UserId) -> Vec<WaitlistEntry> {
        self.lock()
            .waitlist
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn add_participant(&self, participant: Participant) {
        self.lock().participants.push(participant);
    }

    pub fn participant_error(&self, id: ParticipantId) -> Option<String> {
        self.lock()
            .participant_errors
            .get(&id)
            .map(|(error, _)| error.clone())
    }

    pub fn add_wallet(&self, wallet: UserWallet) {
        self.lock().wallets.push(wallet);
    }

    pub fn set_settlement_config(&self, config: SettlementConfig) {
        self.lock().settlement = Some(config);
    }

    pub fn incidents(&self) -> Vec<ReorgIncident> {
        self.lock().incidents.clone()
    }

    /// Test hook: overwrite a deposit row
    pub fn put_deposit(&self, deposit: Deposit) {
        self.lock().deposits.insert(deposit.id, deposit);
    }

    /// Make `complete_payout` fail like a dropped database connection
    #[cfg(test)]
    pub(crate) fn set_fail_payout_completion(&self, fail: bool) {
        self.lock().fail_payout_completion = fail;
    }

    #[cfg(test)]
    pub(crate) fn set_fail_deposit_inserts(&self, fail: bool) {
        self.lock().fail_deposit_inserts = fail;
    }
}

fn push_incident(st: &mut State, new: NewIncident) -> ReorgIncident {
    let incident = ReorgIncident {
        id: st.next_id(),
        deposit_id: new.deposit_id,
        user_id: new.user_id,
        amount: new.amount,
        status: new.status,
        reason: new.reason,
        detected_at: new.detected_at,
    };
    st.incidents.push(incident.clone());
    incident
}

#[async_trait]
impl AddressStore for MemoryLedger {
    async fn find_deposit_address(
        &self,
        user_id: UserId,
        chain: Chain,
    ) -> LedgerResult<Option<DepositAddress>> {
        Ok(self
            .lock()
            .addresses
            .values()
            .find(|a| a.user_id == user_id && a.chain == chain)
            .cloned())
    }

    async fn deposit_address_by_id(
        &self,
        id: DepositAddressId,
    ) -> LedgerResult<Option<DepositAddress>> {
        Ok(self.lock().addresses.get(&id).cloned())
    }

    async fn user_addresses(&self, user_id: UserId) -> LedgerResult<Vec<DepositAddress>> {
        let mut rows: Vec<_> = self
            .lock()
            .addresses
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.created_at, a.id));
        Ok(rows)
    }

    async fn max_derivation_index(
        &self,
        family: ChainFamily,
    ) -> LedgerResult<Option<DerivationIndex>> {
        Ok(self
            .lock()
            .addresses
            .values()
            .filter(|a| a.chain.family() == family)
            .map(|a| a.derivation_index)
            .max())
    }

    async fn insert_deposit_address(
        &self,
        new: NewDepositAddress,
        now: DateTime<Utc>,
    ) -> LedgerResult<DepositAddress> {
        let mut st = self.lock();
        if let Some(existing) = st
            .addresses
            .values()
            .find(|a| a.user_id == new.user_id && a.chain == new.chain)
        {
            return Ok(existing.clone());
        }
        let row = DepositAddress {
            id: st.next_id(),
            user_id: new.user_id,
            chain: new.chain,
            address: new.address,
            derivation_index: new.derivation_index,
            cached_balance: None,
            cached_balance_at: None,
            created_at: now,
        };
        st.addresses.insert(row.id, row.clone());
        Ok(row)
    }

    async fn repoint_deposit_address(
        &self,
        id: DepositAddressId,
        address: &str,
        derivation_index: DerivationIndex,
    ) -> LedgerResult<()> {
        let mut st = self.lock();
        let row = st
            .addresses
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("deposit address {}", id)))?;
        row.address = address.to_string();
        row.derivation_index = derivation_index;
        Ok(())
    }

    async fn watched_addresses(&self, chain: Chain) -> LedgerResult<Vec<DepositAddress>> {
        Ok(self
            .lock()
            .addresses
            .values()
            .filter(|a| a.chain == chain)
            .cloned()
            .collect())
    }

    async fn update_cached_balance(
        &self,
        id: DepositAddressId,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut st = self.lock();
        if let Some(row) = st.addresses.get_mut(&id) {
            row.cached_balance = Some(balance);
            row.cached_balance_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl DepositStore for MemoryLedger {
    async fn insert_deposit(&self, new: NewDeposit) -> LedgerResult<Option<Deposit>> {
        let mut st = self.lock();
        #[cfg(test)]
        if st.fail_deposit_inserts {
            return Err(LedgerError::Database("connection reset".to_string()));
        }
        if st.deposits.values().any(|d| d.tx_hash == new.tx_hash) {
            return Ok(None);
        }
        let deposit = Deposit {
            id: st.next_id(),
            deposit_address_id: new.deposit_address_id,
            user_id: new.user_id,
            chain: new.chain,
            asset: new.asset,
            amount: new.amount,
            amount_usd: new.amount_usd,
            tx_hash: new.tx_hash,
            block_number: new.block_number,
            block_hash: new.block_hash,
            confirmations: new.confirmations,
            status: DepositStatus::for_confirmations(new.confirmations),
            sweep_batch_id: None,
            sweep_tx_hash: None,
            detected_at: new.detected_at,
            confirmed_at: None,
            safe_at: None,
            swept_at: None,
        };
        st.deposits.insert(deposit.id, deposit.clone());
        Ok(Some(deposit))
    }

    async fn deposit(&self, id: DepositId) -> LedgerResult<Option<Deposit>> {
        Ok(self.lock().deposits.get(&id).cloned())
    }

    async fn deposit_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<Deposit>> {
        Ok(self
            .lock()
            .deposits
            .values()
            .find(|d| d.tx_hash == tx_hash)
            .cloned())
    }

    async fn latest_deposit_block(&self, chain: Chain) -> LedgerResult<Option<u64>> {
        Ok(self
            .lock()
            .deposits
            .values()
            .filter(|d| d.chain == chain)
            .filter_map(|d| d.block_number)
            .max())
    }

    async fn deposits_in_status(
        &self,
        chain: Option<Chain>,
        statuses: &[DepositStatus],
    ) -> LedgerResult<Vec<Deposit>> {
        Ok(self
            .lock()
            .deposits
            .values()
            .filter(|d| chain.is_none_or(|c| d.chain == c) && statuses.contains(&d.status))
            .cloned()
            .collect())
    }

    async fn update_confirmations(&self, id: DepositId, confirmations: u32) -> LedgerResult<bool> {
        let mut st = self.lock();
        let d = st.deposit_mut(id)?;
        if !d.status.is_pre_credit() {
            return Ok(false);
        }
        d.confirmations = d.confirmations.max(confirmations);
        d.status = DepositStatus::for_confirmations(d.confirmations);
        Ok(true)
    }

    async fn set_deposit_usd(&self, id: DepositId, amount_usd: Decimal) -> LedgerResult<()> {
        let mut st = self.lock();
        st.deposit_mut(id)?.amount_usd = Some(amount_usd);
        Ok(())
    }

    async fn credit_deposit(
        &self,
        id: DepositId,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut st = self.lock();
        let d = st.deposit_mut(id)?;
        let Some(usd) = d.amount_usd else {
            return Ok(false);
        };
        if !d.status.is_pre_credit() {
            return Ok(false);
        }
        d.status = DepositStatus::Confirmed;
        d.confirmations = d.confirmations.max(confirmations);
        d.confirmed_at = Some(now);
        d.safe_at = Some(now);
        let user_id = d.user_id;

        *st.balances.entry(user_id).or_default() += usd;
        for entry in st
            .waitlist
            .iter_mut()
            .filter(|w| w.user_id == user_id && w.is_open && !w.has_deposited)
        {
            entry.has_deposited = true;
            entry.deposited_usd += usd;
        }
        Ok(true)
    }

    async fn mark_reorged_before_credit(
        &self,
        id: DepositId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<ReorgIncident>> {
        let mut st = self.lock();
        let d = st.deposit_mut(id)?;
        if !d.status.is_pre_credit() {
            return Ok(None);
        }
        d.status = DepositStatus::Reorged;
        let new = NewIncident {
            deposit_id: d.id,
            user_id: d.user_id,
            amount: d.amount_usd.unwrap_or(Decimal::ZERO),
            status: IncidentStatus::DetectedBeforeCredit,
            reason: reason.to_string(),
            detected_at: now,
        };
        Ok(Some(push_incident(&mut st, new)))
    }

    async fn credited_deposits_since(&self, since: DateTime<Utc>) -> LedgerResult<Vec<Deposit>> {
        Ok(self
            .lock()
            .deposits
            .values()
            .filter(|d| d.status.is_credited() && d.safe_at.is_some_and(|t| t >= since))
            .cloned()
            .collect())
    }

    async fn reverse_credited_deposit(
        &self,
        id: DepositId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReversalOutcome> {
        let mut st = self.lock();
        let d = st.deposit_mut(id)?.clone();
        if d.status != DepositStatus::Confirmed {
            return Ok(ReversalOutcome::NotReversible(d.status));
        }
        if let Some(batch_id) = d.sweep_batch_id {
            return Ok(ReversalOutcome::LinkedToSweep(batch_id));
        }
        let amount = d.amount_usd.unwrap_or(Decimal::ZERO);
        let balance = st.balances.get(&d.user_id).copied().unwrap_or_default();
        if balance < amount {
            return Ok(ReversalOutcome::InsufficientBalance { balance });
        }

        st.balances.insert(d.user_id, balance - amount);
        st.deposit_mut(id)?.status = DepositStatus::Reorged;
        let incident = push_incident(
            &mut st,
            NewIncident {
                deposit_id: id,
                user_id: d.user_id,
                amount,
                status: IncidentStatus::Reversed,
                reason: reason.to_string(),
                detected_at: now,
            },
        );
        Ok(ReversalOutcome::Reversed(incident))
    }

    async fn record_incident(&self, incident: NewIncident) -> LedgerResult<ReorgIncident> {
        Ok(push_incident(&mut self.lock(), incident))
    }

    async fn incidents_for_deposit(&self, id: DepositId) -> LedgerResult<Vec<ReorgIncident>> {
        Ok(self
            .lock()
            .incidents
            .iter()
            .filter(|i| i.deposit_id == id)
            .cloned()
            .collect())
    }

    async fn user_balance(&self, user_id: UserId) -> LedgerResult<Decimal> {
        Ok(self
            .lock()
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn spends_since(&self, user_id: UserId, since: DateTime<Utc>) -> LedgerResult<Decimal> {
        Ok(self
            .lock()
            .spends
            .iter()
            .filter(|(u, _, at)| *u == user_id && *at >= since)
            .map(|(_, amount, _)| *amount)
            .sum())
    }

    async fn deposit_stats(&self) -> LedgerResult<DepositStats> {
        let st = self.lock();
        let mut stats = DepositStats::default();
        for d in st.deposits.values() {
            *stats
                .by_status
                .entry(d.status.as_str().to_string())
                .or_default() += 1;
            if d.status.is_credited() {
                stats.credited_usd += d.amount_usd.unwrap_or_default();
            }
            if d.status.is_pre_credit() {
                *stats
                    .pending_by_chain
                    .entry(d.chain.as_str().to_string())
                    .or_default() += 1;
            }
            if d.amount_usd.is_none() {
                stats.unpriced += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl SweepStore for MemoryLedger {
    async fn sweepable_deposits(&self, chain: Chain, limit: usize) -> LedgerResult<Vec<Deposit>> {
        let mut rows: Vec<_> = self
            .lock()
            .deposits
            .values()
            .filter(|d| {
                d.chain == chain
                    && d.status == DepositStatus::Confirmed
                    && d.sweep_batch_id.is_none()
            })
            .cloned()
            .collect();
        rows.sort_by_key(|d| (d.confirmed_at, d.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn create_sweep_batch(
        &self,
        chain: Chain,
        candidates: &[DepositId],
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<(SweepBatch, Vec<Deposit>)>> {
        let mut st = self.lock();
        let batch_id = st.next_id();
        let mut linked = Vec::new();
        for id in candidates {
            if let Some(d) = st.deposits.get_mut(id)
                && d.chain == chain
                && d.status == DepositStatus::Confirmed
                && d.sweep_batch_id.is_none()
            {
                d.sweep_batch_id = Some(batch_id);
                linked.push(d.clone());
            }
        }
        if linked.is_empty() {
            return Ok(None);
        }
        let batch = SweepBatch {
            id: batch_id,
            chain,
            status: SweepStatus::Pending,
            deposit_count: linked.len() as u32,
            total_amount: linked.iter().map(|d| d.amount).sum(),
            total_usd: linked.iter().filter_map(|d| d.amount_usd).sum(),
            tx_hash: None,
            gas_cost: None,
            created_at: now,
            executed_at: None,
        };
        st.batches.insert(batch_id, batch.clone());
        Ok(Some((batch, linked)))
    }

    async fn mark_deposit_swept(
        &self,
        id: DepositId,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut st = self.lock();
        let d = st.deposit_mut(id)?;
        if d.status == DepositStatus::Confirmed {
            d.status = DepositStatus::Swept;
            d.sweep_tx_hash = Some(tx_hash.to_string());
            d.swept_at = Some(now);
        }
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
        let mut st = self.lock();
        let batch = st
            .batches
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("sweep batch {}", id)))?;
        batch.status = status;
        batch.tx_hash = tx_hash;
        batch.gas_cost = gas_cost;
        batch.executed_at = Some(now);
        Ok(())
    }

    async fn sweep_batch(&self, id: SweepBatchId) -> LedgerResult<Option<SweepBatch>> {
        Ok(self.lock().batches.get(&id).cloned())
    }

    async fn sweep_batches(
        &self,
        chain: Chain,
        status: SweepStatus,
    ) -> LedgerResult<Vec<SweepBatch>> {
        Ok(self
            .lock()
            .batches
            .values()
            .filter(|b| b.chain == chain && b.status == status)
            .cloned()
            .collect())
    }

    async fn batch_deposits(&self, id: SweepBatchId) -> LedgerResult<Vec<Deposit>> {
        Ok(self
            .lock()
            .deposits
            .values()
            .filter(|d| d.sweep_batch_id == Some(id))
            .cloned()
            .collect())
    }

    async fn release_sweep_batch(&self, id: SweepBatchId) -> LedgerResult<u64> {
        let mut st = self.lock();
        match st.batches.get(&id) {
            Some(b) if b.status == SweepStatus::Failed => {}
            Some(b) => {
                return Err(LedgerError::Invariant(format!(
                    "sweep batch {} is {}, only FAILED batches can be released",
                    id, b.status
                )));
            }
            None => return Err(LedgerError::NotFound(format!("sweep batch {}", id))),
        }
        let mut released = 0;
        for d in st
            .deposits
            .values_mut()
            .filter(|d| d.sweep_batch_id == Some(id) && d.status == DepositStatus::Confirmed)
        {
            d.sweep_batch_id = None;
            released += 1;
        }
        st.batches.remove(&id);
        Ok(released)
    }

    async fn release_unswept_deposits(&self, chain: Chain) -> LedgerResult<u64> {
        let mut st = self.lock();
        let completed: Vec<SweepBatchId> = st
            .batches
            .values()
            .filter(|b| b.chain == chain && b.status == SweepStatus::Completed)
            .map(|b| b.id)
            .collect();
        let mut released = 0;
        for d in st.deposits.values_mut().filter(|d| {
            d.status == DepositStatus::Confirmed
                && d.sweep_batch_id.is_some_and(|b| completed.contains(&b))
        }) {
            d.sweep_batch_id = None;
            released += 1;
        }
        Ok(released)
    }

    async fn vault_address(&self, chain: Chain) -> LedgerResult<Option<String>> {
        Ok(self.lock().vaults.get(&chain).cloned())
    }

    async fn sweep_stats(&self) -> LedgerResult<SweepStats> {
        let st = self.lock();
        let mut stats = SweepStats::default();
        for b in st.batches.values() {
            *stats
                .batches_by_status
                .entry(b.status.as_str().to_string())
                .or_default() += 1;
        }
        for d in st.deposits.values() {
            if d.status == DepositStatus::Swept {
                stats.swept_deposits += 1;
                stats.swept_usd += d.amount_usd.unwrap_or_default();
            } else if d.status == DepositStatus::Confirmed && d.sweep_batch_id.is_none() {
                *stats
                    .eligible_by_chain
                    .entry(d.chain.as_str().to_string())
                    .or_default() += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl SettlementStore for MemoryLedger {
    async fn due_participants(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Participant>> {
        let st = self.lock();
        let mut due: Vec<_> = st
            .participants
            .iter()
            .filter(|p| {
                p.expected_payout_at <= now
                    && !st.payouts.values().any(|po| po.participant_id == p.id)
            })
            .cloned()
            .collect();
        due.sort_by_key(|p| {
            let failed_at = st.participant_errors.get(&p.id).map(|(_, at)| *at);
            (failed_at, p.expected_payout_at, p.id)
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn user_wallets(&self, user_id: UserId) -> LedgerResult<Vec<UserWallet>> {
        Ok(self
            .lock()
            .wallets
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn payout_exists(&self, participant_id: ParticipantId) -> LedgerResult<bool> {
        Ok(self
            .lock()
            .payouts
            .values()
            .any(|p| p.participant_id == participant_id))
    }

    async fn insert_payout(&self, new: NewPayout) -> LedgerResult<Option<Payout>> {
        let mut st = self.lock();
        if st
            .payouts
            .values()
            .any(|p| p.participant_id == new.participant_id)
        {
            return Ok(None);
        }
        let payout = Payout {
            id: st.next_id(),
            participant_id: new.participant_id,
            user_id: new.user_id,
            trench_id: new.trench_id,
            amount: new.amount,
            amount_usd: new.amount_usd,
            to_address: new.to_address,
            token_address: new.token_address,
            chain: new.chain,
            status: PayoutStatus::Pending,
            tx_hash: None,
            error: None,
            created_at: new.created_at,
            claimed_at: None,
            executed_at: None,
        };
        st.participant_errors.remove(&new.participant_id);
        st.payouts.insert(payout.id, payout.clone());
        Ok(Some(payout))
    }

    async fn record_payout_error(
        &self,
        participant_id: ParticipantId,
        error: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.lock()
            .participant_errors
            .insert(participant_id, (error.to_string(), now));
        Ok(())
    }

    async fn payout(&self, id: PayoutId) -> LedgerResult<Option<Payout>> {
        Ok(self.lock().payouts.get(&id).cloned())
    }

    async fn pending_payouts(&self, limit: usize) -> LedgerResult<Vec<Payout>> {
        let mut rows: Vec<_> = self
            .lock()
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.created_at, p.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn claim_payout(&self, id: PayoutId, now: DateTime<Utc>) -> LedgerResult<bool> {
        let mut st = self.lock();
        match st.payouts.get_mut(&id) {
            Some(p) if p.status == PayoutStatus::Pending => {
                p.status = PayoutStatus::Executing;
                p.claimed_at = Some(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(format!("payout {}", id))),
        }
    }

    async fn release_payout(&self, id: PayoutId) -> LedgerResult<bool> {
        let mut st = self.lock();
        match st.payouts.get_mut(&id) {
            Some(p) if p.status == PayoutStatus::Executing => {
                p.status = PayoutStatus::Pending;
                p.claimed_at = None;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(format!("payout {}", id))),
        }
    }

    async fn stale_executing_payouts(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Payout>> {
        let mut rows: Vec<_> = self
            .lock()
            .payouts
            .values()
            .filter(|p| {
                p.status == PayoutStatus::Executing
                    && p.claimed_at.is_some_and(|t| t < claimed_before)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.claimed_at, p.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn complete_payout(
        &self,
        id: PayoutId,
        status: PayoutStatus,
        tx_hash: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut st = self.lock();
        #[cfg(test)]
        if st.fail_payout_completion {
            return Err(LedgerError::Database("connection reset".to_string()));
        }
        let p = st
            .payouts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("payout {}", id)))?;
        p.status = status;
        if tx_hash.is_some() {
            p.tx_hash = tx_hash;
        }
        p.error = error;
        p.executed_at = Some(now);
        Ok(())
    }

    async fn active_settlement_config(&self) -> LedgerResult<Option<SettlementConfig>> {
        Ok(self.lock().settlement.clone())
    }

    async fn migrate_pending_payouts(
        &self,
        token_address: &str,
        chain: Chain,
    ) -> LedgerResult<u64> {
        let mut st = self.lock();
        let mut moved = 0;
        for p in st
            .payouts
            .values_mut()
            .filter(|p| p.status == PayoutStatus::Pending)
        {
            p.token_address = token_address.to_string();
            p.chain = chain;
            moved += 1;
        }
        Ok(moved)
    }
}
