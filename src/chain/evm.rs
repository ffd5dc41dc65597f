//! EVM-family adapter
//!
//! Scans blocks over JSON-RPC for inbound deposits to watched addresses:
//! * native value: walk every block's transaction list (`to` is watched)
//! * tokens: `eth_getLogs` for ERC-20 `Transfer` events per configured contract
//!
//! Both paths yield real transaction and block hashes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::evm_tx::{
    LegacyTx, NATIVE_TRANSFER_GAS, TOKEN_TRANSFER_GAS, TRANSFER_EVENT_TOPIC, address_topic,
    erc20_balance_of_data, erc20_transfer_data, parse_address, topic_to_address,
};
use super::rpc::{NO_PARAMS, RpcClient, parse_hex_u64, to_hex};
use super::{
    CanonicalStatus, ChainAdapter, ChainError, ConfirmationUpdate, DetectedDeposit, NodeHealth,
    ScanBatch, ScanCursor, TxOutcome, assign_tx_ids, base_tx_hash, confirmations_since,
};
use crate::config::{AssetConfig, ChainConfig};
use crate::core_types::{Chain, ChainFamily};
use crate::keys::{KeyBranch, SigningProvider};
use crate::ledger::{Deposit, DepositAddress};
use crate::money::{from_base_units, parse_hex_quantity, to_base_units};

/// Addresses per `eth_getLogs` topic filter
const LOG_ADDRESS_CHUNK: usize = 200;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const GWEI: u128 = 1_000_000_000;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthBlock {
    hash: String,
    #[serde(default)]
    transactions: Vec<EthTransaction>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthBlockHeader {
    hash: String,
    timestamp: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthTransaction {
    hash: String,
    #[serde(default)]
    transaction_index: Option<String>,
    to: Option<String>,
    value: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthLog {
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    block_hash: Option<String>,
    transaction_hash: Option<String>,
    transaction_index: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

#[derive(Deserialize, Debug)]
struct EthReceipt {
    status: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum SyncingStatus {
    NotSyncing(bool),
    Syncing(serde::de::IgnoredAny),
}

/// A transfer plus its on-chain position, for stable id assignment
struct Located {
    block: u64,
    tx_index: u64,
    /// `None` sorts the native value transfer before the tx's logs
    log_index: Option<u64>,
    deposit: DetectedDeposit,
}

pub struct EvmAdapter {
    config: ChainConfig,
    rpc: RpcClient,
    chain_id: u64,
    signer: Option<Arc<dyn SigningProvider>>,
}

impl EvmAdapter {
    pub fn new(
        config: ChainConfig,
        rpc: RpcClient,
        signer: Option<Arc<dyn SigningProvider>>,
    ) -> Result<Self, ChainError> {
        let chain_id = config.evm_chain_id().ok_or_else(|| {
            ChainError::Config(format!("{}: no EVM chain id configured", config.chain))
        })?;
        info!(
            chain = %config.chain,
            chain_id,
            rpc = %rpc.url(),
            "Initializing EVM adapter"
        );
        Ok(Self {
            config,
            rpc,
            chain_id,
            signer,
        })
    }

    fn signer(&self) -> Result<&Arc<dyn SigningProvider>, ChainError> {
        self.signer
            .as_ref()
            .ok_or_else(|| ChainError::Config("no signing provider configured".to_string()))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let head: String = self.rpc.call("eth_blockNumber", NO_PARAMS).await?;
        parse_hex_u64(&head)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        if let Some(gwei) = self.config.gas_price_gwei {
            return Ok(to_base_units(gwei, 9)?);
        }
        let price: String = self.rpc.call("eth_gasPrice", NO_PARAMS).await?;
        Ok(parse_hex_quantity(&price)?)
    }

    fn gas_limit(asset: &AssetConfig) -> u64 {
        asset.transfer_gas_limit.unwrap_or(if asset.is_native() {
            NATIVE_TRANSFER_GAS
        } else {
            TOKEN_TRANSFER_GAS
        })
    }

    fn native_symbol(&self) -> String {
        self.config.native_asset().symbol
    }

    /// Native value transfers in `[from, to]`
    async fn scan_native(
        &self,
        from: u64,
        to: u64,
        watched: &HashMap<String, String>,
        out: &mut Vec<Located>,
    ) -> Result<(), ChainError> {
        let symbol = self.native_symbol();
        for height in from..=to {
            let block: EthBlock = self
                .rpc
                .call_optional("eth_getBlockByNumber", (to_hex(height), true))
                .await?
                .ok_or(ChainError::BlockNotFound(height))?;

            for tx in &block.transactions {
                let Some(to_addr) = tx.to.as_deref() else {
                    continue;
                };
                let Some(original) = watched.get(&to_addr.to_lowercase()) else {
                    continue;
                };
                let wei = parse_hex_quantity(&tx.value)?;
                if wei == 0 {
                    continue;
                }
                let tx_index = tx
                    .transaction_index
                    .as_deref()
                    .map(parse_hex_u64)
                    .transpose()?
                    .unwrap_or(0);

                debug!(
                    chain = %self.config.chain,
                    tx_hash = %tx.hash,
                    to = %original,
                    wei,
                    "Native transfer to watched address"
                );
                out.push(Located {
                    block: height,
                    tx_index,
                    log_index: None,
                    deposit: DetectedDeposit {
                        tx_hash: tx.hash.to_lowercase(),
                        to_address: original.clone(),
                        asset: symbol.clone(),
                        amount: from_base_units(wei, 18)?,
                        block_number: Some(height),
                        block_hash: Some(block.hash.to_lowercase()),
                        confirmations: 0,
                    },
                });
            }
        }
        Ok(())
    }

    /// ERC-20 `Transfer` events to watched addresses in `[from, to]`
    async fn scan_tokens(
        &self,
        from: u64,
        to: u64,
        watched: &HashMap<String, String>,
        out: &mut Vec<Located>,
    ) -> Result<(), ChainError> {
        let topics: Vec<String> = watched
            .keys()
            .map(|a| parse_address(a).map(|bytes| address_topic(&bytes)))
            .collect::<Result<_, _>>()?;

        for asset in self.config.token_assets() {
            let Some(contract) = asset.contract.as_deref() else {
                continue;
            };
            for chunk in topics.chunks(LOG_ADDRESS_CHUNK) {
                let filter = json!({
                    "fromBlock": to_hex(from),
                    "toBlock": to_hex(to),
                    "address": contract,
                    "topics": [TRANSFER_EVENT_TOPIC, null, chunk],
                });
                let logs: Vec<EthLog> = self.rpc.call("eth_getLogs", [filter]).await?;

                for log in logs.into_iter().filter(|l| !l.removed) {
                    if let Some(located) = self.log_to_deposit(log, asset, watched)? {
                        out.push(located);
                    }
                }
            }
        }
        Ok(())
    }

    fn log_to_deposit(
        &self,
        log: EthLog,
        asset: &AssetConfig,
        watched: &HashMap<String, String>,
    ) -> Result<Option<Located>, ChainError> {
        if log.topics.len() < 3 {
            return Ok(None);
        }
        let recipient = topic_to_address(&log.topics[2])?;
        let Some(original) = watched.get(&recipient) else {
            return Ok(None);
        };
        let (Some(tx_hash), Some(block_hex)) = (log.transaction_hash, log.block_number) else {
            // pending log
            return Ok(None);
        };
        let raw = parse_hex_quantity(&log.data)?;
        if raw == 0 {
            return Ok(None);
        }
        let block = parse_hex_u64(&block_hex)?;
        Ok(Some(Located {
            block,
            tx_index: log
                .transaction_index
                .as_deref()
                .map(parse_hex_u64)
                .transpose()?
                .unwrap_or(0),
            log_index: log.log_index.as_deref().map(parse_hex_u64).transpose()?,
            deposit: DetectedDeposit {
                tx_hash: tx_hash.to_lowercase(),
                to_address: original.clone(),
                asset: asset.symbol.clone(),
                amount: from_base_units(raw, asset.decimals)?,
                block_number: Some(block),
                block_hash: log.block_hash.map(|h| h.to_lowercase()),
                confirmations: 0,
            },
        }))
    }

    async fn poll_receipt(&self, hash: &str) -> Result<TxOutcome, ChainError> {
        loop {
            let receipt: Option<EthReceipt> = self
                .rpc
                .call_optional("eth_getTransactionReceipt", [hash])
                .await?;
            if let Some(r) = receipt {
                return Ok(match r.status.as_deref() {
                    Some("0x1") => TxOutcome::Confirmed,
                    _ => TxOutcome::Reverted,
                });
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn nonce(&self, address: &str) -> Result<u64, ChainError> {
        let nonce: String = self
            .rpc
            .call("eth_getTransactionCount", (address, "pending"))
            .await?;
        parse_hex_u64(&nonce)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
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
        let head = self.block_number().await?;
        let from = match cursor.last_block {
            Some(last) => last + 1,
            None => self.config.start_block.unwrap_or(head),
        };
        if from > head {
            return Ok(ScanBatch {
                deposits: Vec::new(),
                cursor: cursor.clone(),
            });
        }
        let to = head.min(from + self.config.max_block_range.max(1) - 1);

        let watched: HashMap<String, String> = watched
            .iter()
            .map(|a| (a.address.to_lowercase(), a.address.clone()))
            .collect();

        let mut located = Vec::new();
        if !watched.is_empty() {
            self.scan_native(from, to, &watched, &mut located).await?;
            self.scan_tokens(from, to, &watched, &mut located).await?;
        }
        located.sort_by_key(|l| (l.block, l.tx_index, l.log_index));

        let mut deposits: Vec<DetectedDeposit> = located
            .into_iter()
            .map(|mut l| {
                l.deposit.confirmations = confirmations_since(head, l.block);
                l.deposit
            })
            .collect();
        assign_tx_ids(&mut deposits);

        if !deposits.is_empty() {
            info!(
                chain = %self.config.chain,
                from,
                to,
                count = deposits.len(),
                "Detected deposits"
            );
        }

        Ok(ScanBatch {
            deposits,
            cursor: ScanCursor {
                last_block: Some(to),
                last_signatures: cursor.last_signatures.clone(),
            },
        })
    }

    async fn check_confirmations(
        &self,
        deposits: &[Deposit],
    ) -> Result<Vec<ConfirmationUpdate>, ChainError> {
        if deposits.is_empty() {
            return Ok(Vec::new());
        }
        let head = self.block_number().await?;
        Ok(deposits
            .iter()
            .filter_map(|d| {
                d.block_number.map(|bn| ConfirmationUpdate {
                    deposit_id: d.id,
                    confirmations: confirmations_since(head, bn),
                    finalized: false,
                })
            })
            .collect())
    }

    async fn verify_block_still_canonical(
        &self,
        deposit: &Deposit,
    ) -> Result<CanonicalStatus, ChainError> {
        let (Some(height), Some(expected)) = (deposit.block_number, deposit.block_hash.as_deref())
        else {
            return Ok(CanonicalStatus::Unverifiable);
        };

        let header: Option<EthBlockHeader> = self
            .rpc
            .call_optional("eth_getBlockByNumber", (to_hex(height), false))
            .await?;
        match header {
            None => Ok(CanonicalStatus::Reorged(format!(
                "block {} no longer available",
                height
            ))),
            Some(h) if !h.hash.eq_ignore_ascii_case(expected) => {
                Ok(CanonicalStatus::Reorged(format!(
                    "block {} hash changed: expected {}, got {}",
                    height, expected, h.hash
                )))
            }
            Some(_) => Ok(CanonicalStatus::Canonical),
        }
    }

    async fn health_check(&self) -> Result<NodeHealth, ChainError> {
        let syncing: SyncingStatus = self.rpc.call("eth_syncing", NO_PARAMS).await?;
        let head = self.block_number().await?;
        let header: Option<EthBlockHeader> = self
            .rpc
            .call_optional("eth_getBlockByNumber", (to_hex(head), false))
            .await?;
        let head_time = header
            .map(|h| parse_hex_u64(&h.timestamp).map(|t| t as i64))
            .transpose()?;

        Ok(NodeHealth {
            head,
            head_time,
            syncing: !matches!(syncing, SyncingStatus::NotSyncing(false)),
        })
    }

    async fn estimate_fee(&self, asset: &AssetConfig) -> Result<Decimal, ChainError> {
        let wei = self.gas_price().await? * Self::gas_limit(asset) as u128;
        Ok(from_base_units(wei, 18)?)
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let wei: String = self
            .rpc
            .call("eth_getBalance", (address, "latest"))
            .await?;
        Ok(from_base_units(parse_hex_quantity(&wei)?, 18)?)
    }

    async fn token_balance(
        &self,
        owner: &str,
        asset: &AssetConfig,
    ) -> Result<Decimal, ChainError> {
        let contract = asset
            .contract
            .as_deref()
            .ok_or_else(|| ChainError::Config(format!("{} has no contract", asset.symbol)))?;
        let data = erc20_balance_of_data(&parse_address(owner)?);
        let call = json!({ "to": contract, "data": format!("0x{}", hex::encode(data)) });
        let result: String = self.rpc.call("eth_call", (call, "latest")).await?;
        Ok(from_base_units(parse_hex_quantity(&result)?, asset.decimals)?)
    }

    async fn transfer(
        &self,
        from: KeyBranch,
        to: &str,
        asset: &AssetConfig,
        amount: Decimal,
    ) -> Result<String, ChainError> {
        let recipient = parse_address(to)?;
        let raw_amount = to_base_units(amount, asset.decimals)?;
        let (tx_to, value, data) = match asset.contract.as_deref() {
            None => (recipient, raw_amount, Vec::new()),
            Some(contract) => (
                parse_address(contract)?,
                0,
                erc20_transfer_data(&recipient, raw_amount),
            ),
        };

        let key = self.signer()?.evm_key(from)?;
        let tx = LegacyTx {
            nonce: self.nonce(key.address()).await?,
            gas_price: self.gas_price().await?,
            gas_limit: Self::gas_limit(asset),
            to: tx_to,
            value,
            data,
            chain_id: self.chain_id,
        };
        let raw = tx.sign(&key)?;
        drop(key);

        let tx_hash: String = self
            .rpc
            .call(
                "eth_sendRawTransaction",
                [format!("0x{}", hex::encode(&raw))],
            )
            .await?;
        info!(
            chain = %self.config.chain,
            tx_hash = %tx_hash,
            to = %to,
            asset = %asset.symbol,
            %amount,
            gas_price_gwei = (tx.gas_price / GWEI) as u64,
            "Transfer broadcast"
        );
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        let hash = base_tx_hash(tx_id);
        match tokio::time::timeout(timeout, self.poll_receipt(hash)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(chain = %self.config.chain, tx_hash = %hash, "Receipt wait timed out");
                Err(ChainError::Timeout(format!("receipt for {}", hash)))
            }
        }
    }

    fn vault_address(&self) -> Result<String, ChainError> {
        Ok(self
            .signer()?
            .address(ChainFamily::Evm, KeyBranch::PayoutVault)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChainConfig {
        serde_yaml::from_str(
            r#"
chain: base
rpc_url: "http://127.0.0.1:8545"
confirmations: 12
min_sweep_usd: 10
assets:
  - symbol: ETH
    decimals: 18
    dust_threshold: "0.001"
  - symbol: USDC
    contract: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
    decimals: 6
    dust_threshold: "1"
"#,
        )
        .unwrap()
    }

    fn adapter() -> EvmAdapter {
        EvmAdapter::new(
            config(),
            RpcClient::new("http://127.0.0.1:8545").unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_chain_id_defaults_per_chain() {
        assert_eq!(adapter().chain_id, 8453);
    }

    #[test]
    fn test_gas_limits() {
        let cfg = config();
        assert_eq!(EvmAdapter::gas_limit(&cfg.native_asset()), 21_000);
        let usdc = cfg.asset_by_symbol("USDC").unwrap();
        assert_eq!(EvmAdapter::gas_limit(usdc), 65_000);
    }

    #[test]
    fn test_log_to_deposit() {
        let a = adapter();
        let watched: HashMap<String, String> = [(
            "0xd8da6bf26964af9d7eed9e03e53415d37aa96045".to_string(),
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".to_string(),
        )]
        .into_iter()
        .collect();
        let log: EthLog = serde_json::from_value(json!({
            "topics": [
                TRANSFER_EVENT_TOPIC,
                "0x0000000000000000000000001111111111111111111111111111111111111111",
                "0x000000000000000000000000d8da6bf26964af9d7eed9e03e53415d37aa96045"
            ],
            "data": "0x0000000000000000000000000000000000000000000000000000000005f5e100",
            "blockNumber": "0x64",
            "blockHash": "0xABC",
            "transactionHash": "0xDEF",
            "transactionIndex": "0x2",
            "logIndex": "0x5"
        }))
        .unwrap();
        let cfg = config();
        let usdc = cfg.asset_by_symbol("USDC").unwrap();
        let located = a.log_to_deposit(log, usdc, &watched).unwrap().unwrap();
        assert_eq!(located.block, 100);
        assert_eq!(located.log_index, Some(5));
        assert_eq!(located.deposit.amount, Decimal::new(100, 0));
        assert_eq!(located.deposit.asset, "USDC");
        assert_eq!(located.deposit.tx_hash, "0xdef");
        assert_eq!(
            located.deposit.to_address,
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"
        );
    }

    #[test]
    fn test_log_to_unwatched_ignored() {
        let a = adapter();
        let log: EthLog = serde_json::from_value(json!({
            "topics": [
                TRANSFER_EVENT_TOPIC,
                "0x0000000000000000000000001111111111111111111111111111111111111111",
                "0x0000000000000000000000002222222222222222222222222222222222222222"
            ],
            "data": "0x01",
            "blockNumber": "0x1",
            "transactionHash": "0x01"
        }))
        .unwrap();
        let cfg = config();
        let usdc = cfg.asset_by_symbol("USDC").unwrap();
        assert!(
            a.log_to_deposit(log, usdc, &HashMap::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_syncing_status_parse() {
        let s: SyncingStatus = serde_json::from_str("false").unwrap();
        assert!(matches!(s, SyncingStatus::NotSyncing(false)));
        let s: SyncingStatus =
            serde_json::from_str(r#"{"startingBlock":"0x0","currentBlock":"0x1"}"#).unwrap();
        assert!(matches!(s, SyncingStatus::Syncing(_)));
    }

    #[tokio::test]
    async fn test_transfer_without_signer_is_config_error() {
        let a = adapter();
        let cfg = config();
        let err = a
            .transfer(
                KeyBranch::PayoutVault,
                "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045",
                &cfg.native_asset(),
                Decimal::ONE,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
    }
}
