//! Ledger entities

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::core_types::{
    Chain, ChainFamily, DepositAddressId, DepositId, DerivationIndex, ParticipantId, PayoutId,
    SweepBatchId, UserId,
};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($s => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Deposit lifecycle.
    ///
    /// ```text
    /// PENDING -> CONFIRMING -> CONFIRMED -> SWEPT
    ///    \___________\______________\______> REORGED
    /// ```
    /// Only PENDING/CONFIRMING are pre-credit; CONFIRMED and SWEPT have been
    /// credited to the user's balance.
    DepositStatus {
        Pending => "PENDING",
        Confirming => "CONFIRMING",
        Confirmed => "CONFIRMED",
        Swept => "SWEPT",
        Reorged => "REORGED",
    }
}

impl DepositStatus {
    pub const PRE_CREDIT: [DepositStatus; 2] = [DepositStatus::Pending, DepositStatus::Confirming];
    pub const CREDITED: [DepositStatus; 2] = [DepositStatus::Confirmed, DepositStatus::Swept];

    #[inline]
    pub fn is_pre_credit(&self) -> bool {
        Self::PRE_CREDIT.contains(self)
    }

    #[inline]
    pub fn is_credited(&self) -> bool {
        Self::CREDITED.contains(self)
    }

    /// Status for a pre-credit deposit with `confirmations`
    pub fn for_confirmations(confirmations: u32) -> Self {
        if confirmations == 0 {
            DepositStatus::Pending
        } else {
            DepositStatus::Confirming
        }
    }
}

string_enum! {
    SweepStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

string_enum! {
    /// Append-only audit trail of reorg handling
    IncidentStatus {
        DetectedBeforeCredit => "DETECTED_BEFORE_CREDIT",
        RequiresReview => "REQUIRES_REVIEW",
        Reversed => "REVERSED",
    }
}

string_enum! {
    PayoutStatus {
        Pending => "PENDING",
        Executing => "EXECUTING",
        Confirmed => "CONFIRMED",
        Failed => "FAILED",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositAddress {
    pub id: DepositAddressId,
    pub user_id: UserId,
    pub chain: Chain,
    pub address: String,
    pub derivation_index: DerivationIndex,
    pub cached_balance: Option<Decimal>,
    pub cached_balance_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDepositAddress {
    pub user_id: UserId,
    pub chain: Chain,
    pub address: String,
    pub derivation_index: DerivationIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deposit {
    pub id: DepositId,
    pub deposit_address_id: DepositAddressId,
    pub user_id: UserId,
    pub chain: Chain,
    pub asset: String,
    pub amount: Decimal,
    /// `None` until the oracle prices it
    pub amount_usd: Option<Decimal>,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub confirmations: u32,
    pub status: DepositStatus,
    pub sweep_batch_id: Option<SweepBatchId>,
    pub sweep_tx_hash: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Moment the credit became spendable
    pub safe_at: Option<DateTime<Utc>>,
    pub swept_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub deposit_address_id: DepositAddressId,
    pub user_id: UserId,
    pub chain: Chain,
    pub asset: String,
    pub amount: Decimal,
    pub amount_usd: Option<Decimal>,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub confirmations: u32,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepBatch {
    pub id: SweepBatchId,
    pub chain: Chain,
    pub status: SweepStatus,
    pub deposit_count: u32,
    /// Sum of linked deposit amounts at creation time
    pub total_amount: Decimal,
    pub total_usd: Decimal,
    /// Comma-separated transfer ids of successful items
    pub tx_hash: Option<String>,
    pub gas_cost: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReorgIncident {
    pub id: i64,
    pub deposit_id: DepositId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub status: IncidentStatus,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub deposit_id: DepositId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub status: IncidentStatus,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Result of an atomic post-credit reversal attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReversalOutcome {
    Reversed(ReorgIncident),
    /// Status no longer CONFIRMED (already reversed, swept, ...)
    NotReversible(DepositStatus),
    /// Balance dropped below the deposit between check and debit
    InsufficientBalance { balance: Decimal },
    /// Claimed by a sweep batch; funds may already be moving to the vault
    LinkedToSweep(SweepBatchId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payout {
    pub id: PayoutId,
    pub participant_id: ParticipantId,
    pub user_id: UserId,
    pub trench_id: i64,
    /// Token units
    pub amount: Decimal,
    pub amount_usd: Decimal,
    pub to_address: String,
    pub token_address: String,
    pub chain: Chain,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when a worker moves the payout to EXECUTING
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub participant_id: ParticipantId,
    pub user_id: UserId,
    pub trench_id: i64,
    pub amount: Decimal,
    pub amount_usd: Decimal,
    pub to_address: String,
    pub token_address: String,
    pub chain: Chain,
    pub created_at: DateTime<Utc>,
}

/// Campaign participant owed a USD payout (owned by the campaign system)
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: UserId,
    pub trench_id: i64,
    pub payout_usd: Decimal,
    pub expected_payout_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserWallet {
    pub user_id: UserId,
    pub wallet_type: String,
    pub family: ChainFamily,
    pub address: String,
}

/// Accepted settlement asset
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementConfig {
    pub token_symbol: String,
    pub token_address: String,
    pub chain: Chain,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitlistEntry {
    pub id: i64,
    pub user_id: UserId,
    pub campaign_id: i64,
    pub is_open: bool,
    pub has_deposited: bool,
    pub deposited_usd: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DepositStats {
    pub by_status: BTreeMap<String, u64>,
    pub credited_usd: Decimal,
    /// Pre-credit deposits per chain
    pub pending_by_chain: BTreeMap<String, u64>,
    pub unpriced: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepStats {
    pub batches_by_status: BTreeMap<String, u64>,
    pub swept_deposits: u64,
    pub swept_usd: Decimal,
    /// CONFIRMED deposits not yet linked to a batch, per chain
    pub eligible_by_chain: BTreeMap<String, u64>,
}
