//! Custody Error Types
//!
//! Umbrella error for the custody components. Per-layer errors
//! (`ChainError`, `LedgerError`, `KeyError`) convert into it.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::chain::ChainError;
use crate::core_types::Chain;
use crate::keys::KeyError;
use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum CustodyError {
    /// Retried on the next scheduled tick, never surfaced as a failure
    #[error("Transient RPC error: {0}")]
    TransientRpc(String),

    /// Fatal to one payout/sweep item only
    #[error("Insufficient funds: required {required}, available {available}, shortfall {shortfall}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },

    #[error("Re-org detected: {0}")]
    ReorgDetected(String),

    /// Feature disabled with a warning
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Duplicate deposit: {0}")]
    DuplicateDeposit(String),

    #[error("Unresolved price for {asset} on {chain}")]
    UnresolvedPrice { asset: String, chain: Chain },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Signing error: {0}")]
    Signing(#[from] KeyError),

    #[error("Chain error: {0}")]
    Chain(String),
}

impl CustodyError {
    pub fn insufficient(required: Decimal, available: Decimal) -> Self {
        CustodyError::InsufficientFunds {
            required,
            available,
            shortfall: (required - available).max(Decimal::ZERO),
        }
    }

    /// Stable error code for logs, alerts and API layers
    pub fn code(&self) -> &'static str {
        match self {
            CustodyError::TransientRpc(_) => "TRANSIENT_RPC",
            CustodyError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CustodyError::ReorgDetected(_) => "REORG_DETECTED",
            CustodyError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            CustodyError::DuplicateDeposit(_) => "DUPLICATE_DEPOSIT",
            CustodyError::UnresolvedPrice { .. } => "UNRESOLVED_PRICE",
            CustodyError::Ledger(_) => "LEDGER_ERROR",
            CustodyError::Signing(_) => "SIGNING_ERROR",
            CustodyError::Chain(_) => "CHAIN_ERROR",
        }
    }

    /// Errors that resolve themselves by waiting for the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CustodyError::TransientRpc(_) | CustodyError::UnresolvedPrice { .. }
        )
    }
}

impl From<ChainError> for CustodyError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Rpc(msg) | ChainError::Timeout(msg) => CustodyError::TransientRpc(msg),
            ChainError::InsufficientFunds {
                required,
                available,
            } => CustodyError::insufficient(required, available),
            ChainError::Key(k) => CustodyError::Signing(k),
            other => CustodyError::Chain(other.to_string()),
        }
    }
}
