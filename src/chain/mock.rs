//! Scriptable in-memory chain for tests

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    CanonicalStatus, ChainAdapter, ChainError, ConfirmationUpdate, DetectedDeposit, NodeHealth,
    ScanBatch, ScanCursor, TxOutcome, base_tx_hash, confirmations_since,
};
use crate::config::{AssetConfig, ChainConfig};
use crate::core_types::Chain;
use crate::keys::KeyBranch;
use crate::ledger::{Deposit, DepositAddress};

#[derive(Debug, Clone, PartialEq)]
pub struct MockTransfer {
    pub tx_id: String,
    pub from: KeyBranch,
    pub to: String,
    pub asset: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Confirmed,
    Reverted,
    Timeout,
}

struct MockState {
    head: u64,
    head_time: Option<i64>,
    syncing: bool,
    block_hashes: HashMap<u64, String>,
    pushed: Vec<DetectedDeposit>,
    balances: HashMap<(String, String), Decimal>,
    branches: Vec<(KeyBranch, String)>,
    fee: Decimal,
    transfers: Vec<MockTransfer>,
    transfer_error: Option<ChainError>,
    scan_error: Option<ChainError>,
    outcome: MockOutcome,
    vault: String,
    scans: usize,
}

pub struct MockChain {
    config: ChainConfig,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MockState {
                head: 100,
                head_time: None,
                syncing: false,
                block_hashes: HashMap::new(),
                pushed: Vec::new(),
                balances: HashMap::new(),
                branches: Vec::new(),
                fee: Decimal::new(1, 3),
                transfers: Vec::new(),
                transfer_error: None,
                scan_error: None,
                outcome: MockOutcome::Confirmed,
                vault: "VAULT".to_string(),
                scans: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub fn set_head_time(&self, t: Option<i64>) {
        self.state().head_time = t;
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.state().syncing = syncing;
    }

    pub fn block_hash(height: u64) -> String {
        format!("0xblock{}", height)
    }

    /// Replace the canonical hash at `height`
    pub fn reorg_block(&self, height: u64) {
        self.state()
            .block_hashes
            .insert(height, format!("0xreorged{}", height));
    }

    /// Returned by every scan whose range covers `block`, with the block's
    /// current hash
    pub fn push_deposit(&self, tx_hash: &str, to: &str, asset: &str, amount: Decimal, block: u64) {
        let mut st = self.state();
        let hash = st
            .block_hashes
            .get(&block)
            .cloned()
            .unwrap_or_else(|| Self::block_hash(block));
        st.pushed.push(DetectedDeposit {
            tx_hash: tx_hash.to_string(),
            to_address: to.to_string(),
            asset: asset.to_string(),
            amount,
            block_number: Some(block),
            block_hash: Some(hash),
            confirmations: 0,
        });
    }

    pub fn set_scan_error(&self, err: Option<ChainError>) {
        self.state().scan_error = err;
    }

    pub fn scans(&self) -> usize {
        self.state().scans
    }

    pub fn set_balance(&self, address: &str, asset: &str, amount: Decimal) {
        self.state()
            .balances
            .insert((address.to_string(), asset.to_string()), amount);
    }

    pub fn balance(&self, address: &str, asset: &str) -> Decimal {
        self.state()
            .balances
            .get(&(address.to_string(), asset.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Address that `transfer` debits for `branch`
    pub fn bind_branch(&self, branch: KeyBranch, address: &str) {
        self.state().branches.push((branch, address.to_string()));
    }

    pub fn set_fee(&self, fee: Decimal) {
        self.state().fee = fee;
    }

    /// Every transfer fails with `err` until cleared
    pub fn set_transfer_error(&self, err: Option<ChainError>) {
        self.state().transfer_error = err;
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        self.state().outcome = outcome;
    }

    pub fn vault(&self) -> String {
        self.state().vault.clone()
    }

    pub fn transfers(&self) -> Vec<MockTransfer> {
        self.state().transfers.clone()
    }

    fn canonical_hash(st: &MockState, height: u64) -> String {
        st.block_hashes
            .get(&height)
            .cloned()
            .unwrap_or_else(|| Self::block_hash(height))
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    fn chain(&self) -> Chain {
        self.config.chain
    }

    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn scan_for_deposits(
        &self,
        cursor: &ScanCursor,
        watched: &[DepositAddress],
    ) -> Result<ScanBatch, ChainError> {
        let mut st = self.state();
        st.scans += 1;
        if let Some(err) = st.scan_error.clone() {
            return Err(err);
        }
        let head = st.head;
        let from = cursor.last_block.map_or(0, |b| b + 1);
        let deposits = st
            .pushed
            .iter()
            .filter(|d| d.block_number.is_none_or(|b| b >= from && b <= head))
            .filter(|d| watched.iter().any(|a| a.address == d.to_address))
            .cloned()
            .map(|mut d| {
                d.confirmations = d.block_number.map_or(0, |b| confirmations_since(head, b));
                d
            })
            .collect();
        Ok(ScanBatch {
            deposits,
            cursor: ScanCursor {
                last_block: Some(head),
                last_signatures: cursor.last_signatures.clone(),
            },
        })
    }

    async fn check_confirmations(
        &self,
        deposits: &[Deposit],
    ) -> Result<Vec<ConfirmationUpdate>, ChainError> {
        let head = self.state().head;
        Ok(deposits
            .iter()
            .filter_map(|d| {
                d.block_number.map(|b| ConfirmationUpdate {
                    deposit_id: d.id,
                    confirmations: confirmations_since(head, b),
                    finalized: false,
                })
            })
            .collect())
    }

    async fn verify_block_still_canonical(
        &self,
        deposit: &Deposit,
    ) -> Result<CanonicalStatus, ChainError> {
        let st = self.state();
        let (Some(height), Some(hash)) = (deposit.block_number, deposit.block_hash.as_deref())
        else {
            return Ok(CanonicalStatus::Unverifiable);
        };
        if Self::canonical_hash(&st, height) == hash {
            Ok(CanonicalStatus::Canonical)
        } else {
            Ok(CanonicalStatus::Reorged(format!(
                "block {} hash changed",
                height
            )))
        }
    }

    async fn health_check(&self) -> Result<NodeHealth, ChainError> {
        let st = self.state();
        Ok(NodeHealth {
            head: st.head,
            head_time: st.head_time,
            syncing: st.syncing,
        })
    }

    async fn estimate_fee(&self, _asset: &AssetConfig) -> Result<Decimal, ChainError> {
        Ok(self.state().fee)
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        Ok(self.balance(address, &self.config.native_asset().symbol))
    }

    async fn token_balance(
        &self,
        owner: &str,
        asset: &AssetConfig,
    ) -> Result<Decimal, ChainError> {
        Ok(self.balance(owner, &asset.symbol))
    }

    async fn transfer(
        &self,
        from: KeyBranch,
        to: &str,
        asset: &AssetConfig,
        amount: Decimal,
    ) -> Result<String, ChainError> {
        let mut st = self.state();
        if let Some(err) = st.transfer_error.clone() {
            return Err(err);
        }
        let source = if from == KeyBranch::PayoutVault {
            Some(st.vault.clone())
        } else {
            st.branches
                .iter()
                .find(|(b, _)| *b == from)
                .map(|(_, a)| a.clone())
        };
        if let Some(source) = source {
            let entry = st
                .balances
                .entry((source, asset.symbol.clone()))
                .or_insert(Decimal::ZERO);
            *entry -= amount;
        }
        *st.balances
            .entry((to.to_string(), asset.symbol.clone()))
            .or_insert(Decimal::ZERO) += amount;

        let tx_id = format!("0xmocktx{}", st.transfers.len() + 1);
        st.transfers.push(MockTransfer {
            tx_id: tx_id.clone(),
            from,
            to: to.to_string(),
            asset: asset.symbol.clone(),
            amount,
        });
        Ok(tx_id)
    }

    async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        _timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        match self.state().outcome {
            MockOutcome::Confirmed => Ok(TxOutcome::Confirmed),
            MockOutcome::Reverted => Ok(TxOutcome::Reverted),
            MockOutcome::Timeout => Err(ChainError::Timeout(base_tx_hash(tx_id).to_string())),
        }
    }

    fn vault_address(&self) -> Result<String, ChainError> {
        Ok(self.state().vault.clone())
    }
}

/// Chain config with a native asset and one token
pub fn mock_config(chain: Chain) -> ChainConfig {
    let native = AssetConfig::native(chain, Decimal::new(1, 4));
    let token = AssetConfig {
        symbol: "USDC".to_string(),
        contract: Some("0xusdc".to_string()),
        decimals: 6,
        dust_threshold: Decimal::ONE,
        transfer_gas_limit: None,
    };
    ChainConfig {
        chain,
        rpc_url: None,
        chain_id: None,
        confirmations: 3,
        min_sweep_usd: Decimal::new(10, 0),
        poll_interval_ms: 10,
        max_block_range: 100,
        start_block: None,
        cold_start_lookback_blocks: 1_000,
        signature_page_size: 100,
        max_block_lag_secs: 600,
        gas_price_gwei: None,
        assets: vec![native, token],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn watched(address: &str) -> DepositAddress {
        DepositAddress {
            id: 1,
            user_id: 1,
            chain: Chain::Base,
            address: address.to_string(),
            derivation_index: 0,
            cached_balance: None,
            cached_balance_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_future_deposits_wait_for_head() {
        let mock = MockChain::new(mock_config(Chain::Base));
        mock.push_deposit("0x1", "0xaa", "ETH", Decimal::ONE, 150);
        let batch = mock
            .scan_for_deposits(&ScanCursor::default(), &[watched("0xaa")])
            .await
            .unwrap();
        assert!(batch.deposits.is_empty());

        mock.set_head(155);
        let batch = mock
            .scan_for_deposits(&batch.cursor, &[watched("0xaa")])
            .await
            .unwrap();
        assert_eq!(batch.deposits.len(), 1);
        assert_eq!(batch.deposits[0].confirmations, 5);
    }

    #[tokio::test]
    async fn test_transfer_moves_balances() {
        let mock = MockChain::new(mock_config(Chain::Base));
        let cfg = mock_config(Chain::Base);
        mock.bind_branch(KeyBranch::Deposit(0), "0xaa");
        mock.set_balance("0xaa", "ETH", Decimal::new(2, 0));
        mock.transfer(KeyBranch::Deposit(0), "VAULT", &cfg.native_asset(), Decimal::ONE)
            .await
            .unwrap();
        assert_eq!(mock.balance("0xaa", "ETH"), Decimal::ONE);
        assert_eq!(mock.balance("VAULT", "ETH"), Decimal::ONE);
        assert_eq!(mock.transfers().len(), 1);
    }
}
