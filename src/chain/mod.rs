//! Chain adapters
//!
//! One [`ChainAdapter`] per configured chain. Watchers, the reorg guard,
//! sweeps and payouts talk to chains only through this trait, so adding a
//! chain means adding an adapter variant, not another `if evm` branch.
//!
//! The trait has two layers:
//! * the custody contract (`scan_for_deposits`, `check_confirmations`,
//!   `verify_block_still_canonical`, `sweep_address`, `execute_payout`)
//! * chain primitives (fees, balances, `transfer`, confirmation wait)
//!
//! `sweep_address` and `execute_payout` are written once on top of the
//! primitives.

pub mod evm;
pub mod evm_tx;
#[cfg(test)]
pub mod mock;
pub mod rpc;
pub mod solana;
pub mod solana_tx;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{AssetConfig, ChainConfig, CustodyConfig};
use crate::core_types::{Chain, ChainFamily};
use crate::keys::{KeyBranch, KeyError, SigningProvider};
use crate::ledger::{Deposit, DepositAddress};
use crate::money::MoneyError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Block not found at height {0}")]
    BlockNotFound(u64),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Amount {amount} does not cover fee {fee}")]
    FeeExceedsAmount { amount: Decimal, fee: Decimal },

    #[error("Nothing to transfer from {0}")]
    EmptyBalance(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

impl From<MoneyError> for ChainError {
    fn from(e: MoneyError) -> Self {
        ChainError::Parse(e.to_string())
    }
}

/// An inbound transfer seen on chain
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedDeposit {
    /// Ledger transfer id: the tx hash, or `hash:n` for the n-th extra
    /// transfer inside the same transaction
    pub tx_hash: String,
    pub to_address: String,
    /// Asset symbol as configured
    pub asset: String,
    pub amount: Decimal,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub confirmations: u32,
}

/// Disposable scan position. Losing it only causes a harmless re-scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanCursor {
    /// EVM: last fully processed block
    pub last_block: Option<u64>,
    /// Solana: newest processed signature per watched address
    pub last_signatures: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    pub deposits: Vec<DetectedDeposit>,
    pub cursor: ScanCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationUpdate {
    pub deposit_id: i64,
    pub confirmations: u32,
    /// Chain reports finality regardless of count (Solana `finalized`)
    pub finalized: bool,
}

impl ConfirmationUpdate {
    pub fn reaches(&self, threshold: u32) -> bool {
        self.finalized || self.confirmations >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalStatus {
    Canonical,
    /// Block hash changed, block or transaction vanished, or it failed
    Reorged(String),
    /// Not enough recorded data to check (no block hash)
    Unverifiable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub head: u64,
    /// Unix seconds of the head block, when the node reports it
    pub head_time: Option<i64>,
    pub syncing: bool,
}

impl NodeHealth {
    /// Head block older than `max_lag_secs` (or node syncing)
    pub fn is_stale(&self, now_secs: i64, max_lag_secs: i64) -> bool {
        self.syncing || self.head_time.is_some_and(|t| now_secs - t > max_lag_secs)
    }
}

/// One deposit's funds to move into the vault
#[derive(Debug, Clone)]
pub struct SweepSource {
    pub branch: KeyBranch,
    pub address: String,
    pub asset: AssetConfig,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepTransfer {
    pub tx_id: String,
    pub amount: Decimal,
    /// Fee reserved for the transfer, in native units
    pub fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayoutOutcome {
    Confirmed { tx_id: String },
    Reverted { tx_id: String },
    /// Sent but not confirmed within the timeout
    TimedOut { tx_id: String },
    /// The send itself timed out; the transaction may or may not be on chain
    SendUnknown { error: String },
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    fn config(&self) -> &ChainConfig;

    fn family(&self) -> ChainFamily {
        self.chain().family()
    }

    // --- custody contract ---

    /// Inbound transfers to `watched` since `cursor`
    async fn scan_for_deposits(
        &self,
        cursor: &ScanCursor,
        watched: &[DepositAddress],
    ) -> Result<ScanBatch, ChainError>;

    /// Current confirmation state of pre-credit deposits. Deposits the chain
    /// knows nothing about are omitted.
    async fn check_confirmations(
        &self,
        deposits: &[Deposit],
    ) -> Result<Vec<ConfirmationUpdate>, ChainError>;

    async fn verify_block_still_canonical(
        &self,
        deposit: &Deposit,
    ) -> Result<CanonicalStatus, ChainError>;

    async fn health_check(&self) -> Result<NodeHealth, ChainError>;

    // --- primitives ---

    /// Fee for one transfer of `asset`, in native units
    async fn estimate_fee(&self, asset: &AssetConfig) -> Result<Decimal, ChainError>;

    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainError>;

    async fn token_balance(&self, owner: &str, asset: &AssetConfig)
    -> Result<Decimal, ChainError>;

    /// Sign and broadcast; returns the transaction id
    async fn transfer(
        &self,
        from: KeyBranch,
        to: &str,
        asset: &AssetConfig,
        amount: Decimal,
    ) -> Result<String, ChainError>;

    /// `Err(Timeout)` when the transaction is still unconfirmed at `timeout`
    async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError>;

    /// Payout vault address for this chain's family
    fn vault_address(&self) -> Result<String, ChainError>;

    /// Native amount to send when sweeping a native deposit of `amount`
    /// with `fee` reserved
    async fn native_sweep_amount(
        &self,
        _source: &str,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<Decimal, ChainError> {
        Ok(amount - fee)
    }

    async fn balance_of(&self, address: &str, asset: &AssetConfig) -> Result<Decimal, ChainError> {
        if asset.is_native() {
            self.native_balance(address).await
        } else {
            self.token_balance(address, asset).await
        }
    }

    /// Move one deposit's funds to `vault`.
    ///
    /// Native: send `amount - fee * multiplier`, failing when the deposit
    /// does not cover the fee. Token: require native gas on the source, then
    /// send the full token balance.
    async fn sweep_address(
        &self,
        source: &SweepSource,
        vault: &str,
        fee_multiplier: Decimal,
    ) -> Result<SweepTransfer, ChainError> {
        let fee = self.estimate_fee(&source.asset).await? * fee_multiplier;

        let amount = if source.asset.is_native() {
            if source.amount <= fee {
                return Err(ChainError::FeeExceedsAmount {
                    amount: source.amount,
                    fee,
                });
            }
            self.native_sweep_amount(&source.address, source.amount, fee)
                .await?
        } else {
            let gas = self.native_balance(&source.address).await?;
            if gas < fee {
                return Err(ChainError::InsufficientFunds {
                    required: fee,
                    available: gas,
                });
            }
            let balance = self.token_balance(&source.address, &source.asset).await?;
            if balance <= Decimal::ZERO {
                return Err(ChainError::EmptyBalance(source.address.clone()));
            }
            balance
        };

        let tx_id = self
            .transfer(source.branch, vault, &source.asset, amount)
            .await?;
        Ok(SweepTransfer { tx_id, amount, fee })
    }

    /// Pay `amount` of `asset` from the vault to `to` and wait for the
    /// result. Insufficient vault balance fails before anything is sent.
    ///
    /// An `Err` means nothing reached the network. Once a send may have been
    /// broadcast the result is always a [`PayoutOutcome`].
    async fn execute_payout(
        &self,
        to: &str,
        asset: &AssetConfig,
        amount: Decimal,
        timeout: Duration,
    ) -> Result<PayoutOutcome, ChainError> {
        let vault = self.vault_address()?;
        let available = self.balance_of(&vault, asset).await?;
        if available < amount {
            return Err(ChainError::InsufficientFunds {
                required: amount,
                available,
            });
        }

        let tx_id = match self.transfer(KeyBranch::PayoutVault, to, asset, amount).await {
            Ok(tx_id) => tx_id,
            Err(ChainError::Timeout(error)) => return Ok(PayoutOutcome::SendUnknown { error }),
            Err(e) => return Err(e),
        };
        match self.wait_for_confirmation(&tx_id, timeout).await {
            Ok(TxOutcome::Confirmed) => Ok(PayoutOutcome::Confirmed { tx_id }),
            Ok(TxOutcome::Reverted) => Ok(PayoutOutcome::Reverted { tx_id }),
            Err(ChainError::Timeout(_)) => Ok(PayoutOutcome::TimedOut { tx_id }),
            Err(e) => {
                tracing::warn!(tx_id = %tx_id, error = %e, "Payout sent but confirmation check failed");
                Ok(PayoutOutcome::TimedOut { tx_id })
            }
        }
    }
}

/// Blocks on top of `block` at `head`, saturating at both ends
pub fn confirmations_since(head: u64, block: u64) -> u32 {
    u32::try_from(head.saturating_sub(block)).unwrap_or(u32::MAX)
}

/// Give every transfer a unique ledger id. Transfers must be in a stable
/// on-chain order (block, tx position, log index) so re-scans agree.
pub fn assign_tx_ids(deposits: &mut [DetectedDeposit]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for d in deposits.iter_mut() {
        let n = seen.entry(d.tx_hash.clone()).or_insert(0);
        if *n > 0 {
            d.tx_hash = format!("{}:{}", d.tx_hash, n);
        }
        *n += 1;
    }
}

/// On-chain transaction id behind a ledger transfer id
pub fn base_tx_hash(id: &str) -> &str {
    id.split_once(':').map_or(id, |(hash, _)| hash)
}

/// Adapters by chain
#[derive(Clone, Default)]
pub struct ChainRegistry {
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    pub fn get(&self, chain: Chain) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(&chain).cloned()
    }

    pub fn chains(&self) -> Vec<Chain> {
        let mut chains: Vec<_> = self.adapters.keys().copied().collect();
        chains.sort();
        chains
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Build an adapter for every chain that has an RPC URL. Chains without
    /// one are skipped with a warning.
    pub fn from_config(
        config: &CustodyConfig,
        signer: Option<Arc<dyn SigningProvider>>,
    ) -> Result<Self, ChainError> {
        let mut registry = Self::new();
        for chain_cfg in &config.chains {
            let Some(url) = chain_cfg.rpc_url.clone() else {
                tracing::warn!(
                    chain = %chain_cfg.chain,
                    "No RPC URL configured, chain disabled"
                );
                continue;
            };
            let adapter: Arc<dyn ChainAdapter> = match chain_cfg.chain.family() {
                ChainFamily::Evm => Arc::new(evm::EvmAdapter::new(
                    chain_cfg.clone(),
                    rpc::RpcClient::new(&url)?,
                    signer.clone(),
                )?),
                ChainFamily::Solana => Arc::new(solana::SolanaAdapter::new(
                    chain_cfg.clone(),
                    rpc::RpcClient::new(&url)?,
                    signer.clone(),
                )),
            };
            tracing::info!(chain = %chain_cfg.chain, rpc = %url, "Chain adapter ready");
            registry.insert(adapter);
        }
        Ok(registry)
    }
}
