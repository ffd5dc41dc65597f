//! Custody ledger
//!
//! The ledger is the only shared, durable resource. Every operation that
//! must be atomic (deposit crediting, reorg reversal, sweep claiming,
//! payout claiming) is a single store call so implementations can wrap it
//! in one transaction.
//!
//! Two stores ship: [`PgLedger`] (sqlx/PostgreSQL) and [`MemoryLedger`]
//! (tests, dry runs).

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::{
    Chain, ChainFamily, DepositAddressId, DepositId, DerivationIndex, ParticipantId, PayoutId,
    SweepBatchId, UserId,
};

pub use memory::MemoryLedger;
pub use models::*;
pub use postgres::PgLedger;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait]
pub trait AddressStore: Send + Sync {
    async fn find_deposit_address(
        &self,
        user_id: UserId,
        chain: Chain,
    ) -> LedgerResult<Option<DepositAddress>>;

    async fn deposit_address_by_id(
        &self,
        id: DepositAddressId,
    ) -> LedgerResult<Option<DepositAddress>>;

    /// All rows for a user, oldest first
    async fn user_addresses(&self, user_id: UserId) -> LedgerResult<Vec<DepositAddress>>;

    /// Highest index used anywhere in the family's key tree
    async fn max_derivation_index(
        &self,
        family: ChainFamily,
    ) -> LedgerResult<Option<DerivationIndex>>;

    /// Insert; if (user, chain) already exists the existing row is returned
    async fn insert_deposit_address(
        &self,
        new: NewDepositAddress,
        now: DateTime<Utc>,
    ) -> LedgerResult<DepositAddress>;

    async fn repoint_deposit_address(
        &self,
        id: DepositAddressId,
        address: &str,
        derivation_index: DerivationIndex,
    ) -> LedgerResult<()>;

    async fn watched_addresses(&self, chain: Chain) -> LedgerResult<Vec<DepositAddress>>;

    async fn update_cached_balance(
        &self,
        id: DepositAddressId,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;
}

#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Idempotent on `tx_hash`: returns `None` if the hash already exists
    async fn insert_deposit(&self, new: NewDeposit) -> LedgerResult<Option<Deposit>>;

    async fn deposit(&self, id: DepositId) -> LedgerResult<Option<Deposit>>;

    async fn deposit_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<Deposit>>;

    /// Highest block holding a recorded deposit on `chain`, any status
    async fn latest_deposit_block(&self, chain: Chain) -> LedgerResult<Option<u64>>;

    /// `chain = None` spans all chains; ordered by id
    async fn deposits_in_status(
        &self,
        chain: Option<Chain>,
        statuses: &[DepositStatus],
    ) -> LedgerResult<Vec<Deposit>>;

    /// Raise confirmations (never lowers them) on a pre-credit deposit.
    /// Returns false if the deposit has left the pre-credit states.
    async fn update_confirmations(
        &self,
        id: DepositId,
        confirmations: u32,
    ) -> LedgerResult<bool>;

    async fn set_deposit_usd(&self, id: DepositId, amount_usd: Decimal) -> LedgerResult<()>;

    /// Atomically: pre-credit -> CONFIRMED, stamp confirmed/safe time, add
    /// `amount_usd` to the user's balance and mark open waitlist entries as
    /// deposited. Returns false (and changes nothing) if not pre-credit or
    /// not priced.
    async fn credit_deposit(
        &self,
        id: DepositId,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    /// Atomically: pre-credit -> REORGED plus a DETECTED_BEFORE_CREDIT incident
    async fn mark_reorged_before_credit(
        &self,
        id: DepositId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<ReorgIncident>>;

    /// Credited deposits whose `safe_at >= since`
    async fn credited_deposits_since(&self, since: DateTime<Utc>) -> LedgerResult<Vec<Deposit>>;

    /// Atomically: debit the user by `amount_usd`, CONFIRMED -> REORGED and a
    /// REVERSED incident. Re-checks status, sweep link and balance inside the
    /// transaction; a deposit linked to a sweep batch is never reversed.
    async fn reverse_credited_deposit(
        &self,
        id: DepositId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReversalOutcome>;

    async fn record_incident(&self, incident: NewIncident) -> LedgerResult<ReorgIncident>;

    async fn incidents_for_deposit(&self, id: DepositId) -> LedgerResult<Vec<ReorgIncident>>;

    async fn user_balance(&self, user_id: UserId) -> LedgerResult<Decimal>;

    /// Sum of user spends created at or after `since`
    async fn spends_since(&self, user_id: UserId, since: DateTime<Utc>) -> LedgerResult<Decimal>;

    async fn deposit_stats(&self) -> LedgerResult<DepositStats>;
}

#[async_trait]
pub trait SweepStore: Send + Sync {
    /// CONFIRMED, unlinked deposits ordered by confirmation time
    async fn sweepable_deposits(&self, chain: Chain, limit: usize) -> LedgerResult<Vec<Deposit>>;

    /// Create a PENDING batch and link every candidate that is still
    /// unlinked, in one transaction. The batch totals cover exactly the
    /// deposits that were linked. Returns `None` if nothing could be linked.
    async fn create_sweep_batch(
        &self,
        chain: Chain,
        candidates: &[DepositId],
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<(SweepBatch, Vec<Deposit>)>>;

    async fn mark_deposit_swept(
        &self,
        id: DepositId,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;

    async fn finish_sweep_batch(
        &self,
        id: SweepBatchId,
        status: SweepStatus,
        tx_hash: Option<String>,
        gas_cost: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;

    async fn sweep_batch(&self, id: SweepBatchId) -> LedgerResult<Option<SweepBatch>>;

    async fn sweep_batches(
        &self,
        chain: Chain,
        status: SweepStatus,
    ) -> LedgerResult<Vec<SweepBatch>>;

    async fn batch_deposits(&self, id: SweepBatchId) -> LedgerResult<Vec<Deposit>>;

    /// Unlink the unswept deposits of a FAILED batch and delete the batch.
    /// Returns the number of deposits made eligible again.
    async fn release_sweep_batch(&self, id: SweepBatchId) -> LedgerResult<u64>;

    /// Unlink CONFIRMED deposits left behind by COMPLETED batches on `chain`
    /// (items that failed inside an otherwise finished batch). Returns the
    /// number of deposits made eligible again.
    async fn release_unswept_deposits(&self, chain: Chain) -> LedgerResult<u64>;

    async fn vault_address(&self, chain: Chain) -> LedgerResult<Option<String>>;

    async fn sweep_stats(&self) -> LedgerResult<SweepStats>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Participants due at `now` without a payout row. Never-attempted
    /// participants come first, then the least recently failed, so a block
    /// of permanently skipped rows cannot starve the rest.
    async fn due_participants(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Participant>>;

    async fn user_wallets(&self, user_id: UserId) -> LedgerResult<Vec<UserWallet>>;

    async fn payout_exists(&self, participant_id: ParticipantId) -> LedgerResult<bool>;

    /// `None` if the participant already has a payout
    async fn insert_payout(&self, new: NewPayout) -> LedgerResult<Option<Payout>>;

    async fn record_payout_error(
        &self,
        participant_id: ParticipantId,
        error: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;

    async fn payout(&self, id: PayoutId) -> LedgerResult<Option<Payout>>;

    /// PENDING payouts, oldest first
    async fn pending_payouts(&self, limit: usize) -> LedgerResult<Vec<Payout>>;

    /// CAS PENDING -> EXECUTING, stamping `claimed_at`
    async fn claim_payout(&self, id: PayoutId, now: DateTime<Utc>) -> LedgerResult<bool>;

    /// CAS EXECUTING -> PENDING for a claim that never reached the chain
    async fn release_payout(&self, id: PayoutId) -> LedgerResult<bool>;

    /// EXECUTING payouts claimed before `claimed_before`, oldest first
    async fn stale_executing_payouts(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Payout>>;

    async fn complete_payout(
        &self,
        id: PayoutId,
        status: PayoutStatus,
        tx_hash: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;

    async fn active_settlement_config(&self) -> LedgerResult<Option<SettlementConfig>>;

    /// Repoint every PENDING payout; other statuses untouched
    async fn migrate_pending_payouts(
        &self,
        token_address: &str,
        chain: Chain,
    ) -> LedgerResult<u64>;
}

/// Everything the custody components need from the ledger
pub trait LedgerStore: AddressStore + DepositStore + SweepStore + SettlementStore {}

impl<T> LedgerStore for T where T: AddressStore + DepositStore + SweepStore + SettlementStore {}
