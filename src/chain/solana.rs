//! Solana adapter
//!
//! Deposits are found per watched address through its signature history.
//! Each transaction is fetched once (`jsonParsed`) and credited from balance
//! deltas: lamports for SOL, owner/mint token balances for SPL assets.
//! Slots stand in for block numbers; there is no block hash, so finality
//! is judged from signature status.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rpc::{NO_PARAMS, RpcClient};
use super::solana_tx::{
    LAMPORTS_PER_SIGNATURE, Message, TOKEN_ACCOUNT_LEN, associated_token_address,
    create_associated_token_account_idempotent, decode_pubkey, system_transfer,
    token_transfer_checked,
};
use super::{
    CanonicalStatus, ChainAdapter, ChainError, ConfirmationUpdate, DetectedDeposit, NodeHealth,
    ScanBatch, ScanCursor, TxOutcome, assign_tx_ids, base_tx_hash,
};
use crate::config::{AssetConfig, ChainConfig};
use crate::core_types::Chain;
use crate::keys::{KeyBranch, SigningProvider};
use crate::ledger::{Deposit, DepositAddress};
use crate::money::{from_base_units, parse_base_units, to_base_units};

const SOL_DECIMALS: u32 = 9;
/// getSignatureStatuses accepts at most 256 signatures per call
const STATUS_CHUNK: usize = 256;
const MAX_SIGNATURE_PAGES: usize = 10;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Deserialize, Debug)]
struct RpcValue<T> {
    value: T,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
    signature: String,
    slot: u64,
    err: Option<serde_json::Value>,
    confirmation_status: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
    confirmations: Option<u64>,
    err: Option<serde_json::Value>,
    confirmation_status: Option<String>,
}

impl SignatureStatus {
    fn is_finalized(&self) -> bool {
        self.confirmation_status.as_deref() == Some("finalized")
    }

    fn is_confirmed(&self) -> bool {
        matches!(
            self.confirmation_status.as_deref(),
            Some("confirmed") | Some("finalized")
        )
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ParsedTransaction {
    slot: u64,
    meta: Option<TransactionMeta>,
    transaction: TransactionBody,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    err: Option<serde_json::Value>,
    pre_balances: Vec<u64>,
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    post_token_balances: Vec<TokenBalance>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TokenBalance {
    account_index: usize,
    mint: String,
    owner: Option<String>,
    ui_token_amount: TokenAmount,
}

#[derive(Deserialize, Debug)]
struct TokenAmount {
    amount: String,
}

#[derive(Deserialize, Debug)]
struct TransactionBody {
    message: ParsedMessage,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ParsedMessage {
    account_keys: Vec<ParsedAccountKey>,
}

#[derive(Deserialize, Debug)]
struct ParsedAccountKey {
    pubkey: String,
}

#[derive(Deserialize, Debug)]
struct TokenAccount {
    account: TokenAccountData,
}

#[derive(Deserialize, Debug)]
struct TokenAccountData {
    data: TokenAccountParsed,
}

#[derive(Deserialize, Debug)]
struct TokenAccountParsed {
    parsed: TokenAccountInfo,
}

#[derive(Deserialize, Debug)]
struct TokenAccountInfo {
    info: TokenAccountAmount,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TokenAccountAmount {
    token_amount: TokenAmount,
}

#[derive(Deserialize, Debug)]
struct LatestBlockhash {
    blockhash: String,
}

pub struct SolanaAdapter {
    config: ChainConfig,
    rpc: RpcClient,
    signer: Option<Arc<dyn SigningProvider>>,
}

impl SolanaAdapter {
    pub fn new(
        config: ChainConfig,
        rpc: RpcClient,
        signer: Option<Arc<dyn SigningProvider>>,
    ) -> Self {
        info!(chain = %config.chain, rpc = %rpc.url(), "Initializing Solana adapter");
        Self {
            config,
            rpc,
            signer,
        }
    }

    fn signer(&self) -> Result<&Arc<dyn SigningProvider>, ChainError> {
        self.signer
            .as_ref()
            .ok_or_else(|| ChainError::Config("no signing provider configured".to_string()))
    }

    fn lamports(amount: Decimal) -> Result<u64, ChainError> {
        let raw = to_base_units(amount, SOL_DECIMALS)?;
        u64::try_from(raw).map_err(|_| ChainError::Parse(format!("{} SOL out of range", amount)))
    }

    /// Signatures newer than `until` (everything in one page if `None`),
    /// newest first
    async fn new_signatures(
        &self,
        address: &str,
        until: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, ChainError> {
        let limit = self.config.signature_page_size.max(1);
        let mut out = Vec::new();
        let mut before: Option<String> = None;

        for _ in 0..MAX_SIGNATURE_PAGES {
            let mut opts = json!({ "limit": limit, "commitment": "confirmed" });
            if let Some(u) = until {
                opts["until"] = json!(u);
            }
            if let Some(b) = &before {
                opts["before"] = json!(b);
            }
            let page: Vec<SignatureInfo> = self
                .rpc
                .call("getSignaturesForAddress", (address, opts))
                .await?;
            let full = page.len() >= limit;
            before = page.last().map(|s| s.signature.clone());
            out.extend(page);
            if !full || until.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn signature_statuses(
        &self,
        signatures: &[&str],
    ) -> Result<Vec<Option<SignatureStatus>>, ChainError> {
        let mut out = Vec::with_capacity(signatures.len());
        for chunk in signatures.chunks(STATUS_CHUNK) {
            let resp: RpcValue<Vec<Option<SignatureStatus>>> = self
                .rpc
                .call(
                    "getSignatureStatuses",
                    (chunk, json!({ "searchTransactionHistory": true })),
                )
                .await?;
            out.extend(resp.value);
        }
        Ok(out)
    }

    async fn rent_exempt_minimum(&self, size: u64) -> Result<Decimal, ChainError> {
        let lamports: u64 = self
            .rpc
            .call("getMinimumBalanceForRentExemption", [size])
            .await?;
        Ok(from_base_units(lamports as u128, SOL_DECIMALS)?)
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32], ChainError> {
        let resp: RpcValue<LatestBlockhash> = self
            .rpc
            .call("getLatestBlockhash", [json!({ "commitment": "confirmed" })])
            .await?;
        decode_pubkey(&resp.value.blockhash)
    }

    async fn poll_status(&self, signature: &str) -> Result<TxOutcome, ChainError> {
        loop {
            let status = self
                .signature_statuses(&[signature])
                .await?
                .into_iter()
                .next()
                .flatten();
            if let Some(s) = status {
                if s.err.is_some() {
                    return Ok(TxOutcome::Reverted);
                }
                if s.is_confirmed() {
                    return Ok(TxOutcome::Confirmed);
                }
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }
}

/// Newest signature of `signatures` (newest first) with no unavailable
/// transaction at or below it. `None` when the oldest one is unavailable.
fn processed_through<'a>(signatures: &'a [String], unavailable: &HashSet<String>) -> Option<&'a str> {
    signatures
        .iter()
        .rev()
        .take_while(|s| !unavailable.contains(*s))
        .last()
        .map(String::as_str)
}

/// Inbound transfers to `watched` inside one transaction, in account order:
/// SOL credits first, then SPL credits.
fn deposits_from_transaction(
    config: &ChainConfig,
    signature: &str,
    tx: &ParsedTransaction,
    watched: &HashSet<&str>,
) -> Result<Vec<DetectedDeposit>, ChainError> {
    let Some(meta) = tx.meta.as_ref() else {
        return Ok(Vec::new());
    };
    if meta.err.is_some() {
        return Ok(Vec::new());
    }
    let keys: Vec<&str> = tx
        .transaction
        .message
        .account_keys
        .iter()
        .map(|k| k.pubkey.as_str())
        .collect();
    let detected = |to: &str, asset: &str, amount: Decimal| DetectedDeposit {
        tx_hash: signature.to_string(),
        to_address: to.to_string(),
        asset: asset.to_string(),
        amount,
        block_number: Some(tx.slot),
        block_hash: None,
        confirmations: 0,
    };

    let mut out = Vec::new();
    let native = config.native_asset();
    for (i, key) in keys.iter().enumerate() {
        if !watched.contains(key) {
            continue;
        }
        let (Some(pre), Some(post)) = (meta.pre_balances.get(i), meta.post_balances.get(i)) else {
            continue;
        };
        if post > pre {
            let amount = from_base_units((post - pre) as u128, SOL_DECIMALS)?;
            out.push(detected(key, &native.symbol, amount));
        }
    }

    // (owner, mint) -> (first account index, pre, post)
    let mut token_deltas: BTreeMap<(String, String), (usize, u128, u128)> = BTreeMap::new();
    for (balances, is_post) in [(&meta.pre_token_balances, false), (&meta.post_token_balances, true)] {
        for b in balances.iter() {
            let Some(owner) = b.owner.as_deref() else {
                continue;
            };
            if !watched.contains(owner) || config.asset_by_contract(&b.mint).is_none() {
                continue;
            }
            let raw = parse_base_units(&b.ui_token_amount.amount)?;
            let entry = token_deltas
                .entry((owner.to_string(), b.mint.clone()))
                .or_insert((b.account_index, 0, 0));
            entry.0 = entry.0.min(b.account_index);
            if is_post {
                entry.2 += raw;
            } else {
                entry.1 += raw;
            }
        }
    }
    let mut credits: Vec<_> = token_deltas
        .into_iter()
        .filter(|(_, (_, pre, post))| post > pre)
        .collect();
    credits.sort_by_key(|(_, (index, _, _))| *index);
    for ((owner, mint), (_, pre, post)) in credits {
        let Some(asset) = config.asset_by_contract(&mint) else {
            continue;
        };
        let amount = from_base_units(post - pre, asset.decimals)?;
        out.push(detected(&owner, &asset.symbol, amount));
    }
    Ok(out)
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
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
        let watched_set: HashSet<&str> = watched.iter().map(|a| a.address.as_str()).collect();
        let mut next_cursor = cursor.clone();
        let mut pending: HashMap<String, SignatureInfo> = HashMap::new();
        let mut per_address: Vec<(&str, Vec<String>)> = Vec::new();

        for address in &watched_set {
            let until = cursor.last_signatures.get(*address).map(String::as_str);
            let signatures = self.new_signatures(address, until).await?;
            per_address.push((address, signatures.iter().map(|s| s.signature.clone()).collect()));
            for sig in signatures {
                if sig.err.is_some() {
                    continue;
                }
                pending.entry(sig.signature.clone()).or_insert(sig);
            }
        }

        let mut ordered: Vec<SignatureInfo> = pending.into_values().collect();
        ordered.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.signature.cmp(&b.signature)));

        let mut deposits = Vec::new();
        let mut unavailable: HashSet<String> = HashSet::new();
        for sig in &ordered {
            let tx: Option<ParsedTransaction> = self
                .rpc
                .call_optional(
                    "getTransaction",
                    (
                        &sig.signature,
                        json!({
                            "encoding": "jsonParsed",
                            "commitment": "confirmed",
                            "maxSupportedTransactionVersion": 0
                        }),
                    ),
                )
                .await?;
            let Some(tx) = tx else {
                debug!(chain = %self.config.chain, signature = %sig.signature, "Transaction not yet available");
                unavailable.insert(sig.signature.clone());
                continue;
            };
            let mut found = deposits_from_transaction(&self.config, &sig.signature, &tx, &watched_set)?;
            if sig.confirmation_status.as_deref() == Some("finalized") {
                for d in &mut found {
                    d.confirmations = self.config.confirmations;
                }
            }
            deposits.extend(found);
            next_cursor.last_block = Some(next_cursor.last_block.unwrap_or(0).max(sig.slot));
        }
        assign_tx_ids(&mut deposits);

        for (address, signatures) in &per_address {
            if let Some(last) = processed_through(signatures, &unavailable) {
                next_cursor
                    .last_signatures
                    .insert(address.to_string(), last.to_string());
            }
        }

        if !deposits.is_empty() {
            info!(
                chain = %self.config.chain,
                signatures = ordered.len(),
                count = deposits.len(),
                "Detected deposits"
            );
        }
        Ok(ScanBatch {
            deposits,
            cursor: next_cursor,
        })
    }

    async fn check_confirmations(
        &self,
        deposits: &[Deposit],
    ) -> Result<Vec<ConfirmationUpdate>, ChainError> {
        if deposits.is_empty() {
            return Ok(Vec::new());
        }
        let signatures: Vec<&str> = deposits.iter().map(|d| base_tx_hash(&d.tx_hash)).collect();
        let statuses = self.signature_statuses(&signatures).await?;

        Ok(deposits
            .iter()
            .zip(statuses)
            .filter_map(|(d, status)| {
                let s = status?;
                if s.err.is_some() {
                    return None;
                }
                let finalized = s.is_finalized();
                let confirmations = match s.confirmations {
                    Some(n) => n.min(u32::MAX as u64) as u32,
                    // rooted: the node stops counting
                    None => self.config.confirmations,
                };
                Some(ConfirmationUpdate {
                    deposit_id: d.id,
                    confirmations,
                    finalized,
                })
            })
            .collect())
    }

    async fn verify_block_still_canonical(
        &self,
        deposit: &Deposit,
    ) -> Result<CanonicalStatus, ChainError> {
        let signature = base_tx_hash(&deposit.tx_hash);
        let status = self
            .signature_statuses(&[signature])
            .await?
            .into_iter()
            .next()
            .flatten();
        Ok(match status {
            None => CanonicalStatus::Reorged(format!("transaction {} not found", signature)),
            Some(s) if s.err.is_some() => {
                CanonicalStatus::Reorged(format!("transaction {} failed", signature))
            }
            Some(_) => CanonicalStatus::Canonical,
        })
    }

    async fn health_check(&self) -> Result<NodeHealth, ChainError> {
        let slot: u64 = self
            .rpc
            .call("getSlot", [json!({ "commitment": "confirmed" })])
            .await?;
        let head_time = match self.rpc.call_optional::<_, i64>("getBlockTime", [slot]).await {
            Ok(t) => t,
            Err(e) => {
                // skipped or pruned slot
                debug!(chain = %self.config.chain, slot, error = %e, "No block time for head slot");
                None
            }
        };
        let healthy = self.rpc.call::<_, String>("getHealth", NO_PARAMS).await.is_ok();
        Ok(NodeHealth {
            head: slot,
            head_time,
            syncing: !healthy,
        })
    }

    async fn estimate_fee(&self, asset: &AssetConfig) -> Result<Decimal, ChainError> {
        let base = from_base_units(LAMPORTS_PER_SIGNATURE as u128, SOL_DECIMALS)?;
        if asset.is_native() {
            return Ok(base);
        }
        // recipient token account may need creating
        Ok(base + self.rent_exempt_minimum(TOKEN_ACCOUNT_LEN).await?)
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let resp: RpcValue<u64> = self
            .rpc
            .call("getBalance", (address, json!({ "commitment": "confirmed" })))
            .await?;
        Ok(from_base_units(resp.value as u128, SOL_DECIMALS)?)
    }

    async fn token_balance(
        &self,
        owner: &str,
        asset: &AssetConfig,
    ) -> Result<Decimal, ChainError> {
        let mint = asset
            .contract
            .as_deref()
            .ok_or_else(|| ChainError::Config(format!("{} has no mint", asset.symbol)))?;
        let resp: RpcValue<Vec<TokenAccount>> = self
            .rpc
            .call(
                "getTokenAccountsByOwner",
                (
                    owner,
                    json!({ "mint": mint }),
                    json!({ "encoding": "jsonParsed", "commitment": "confirmed" }),
                ),
            )
            .await?;
        let mut total: u128 = 0;
        for acct in &resp.value {
            total += parse_base_units(&acct.account.data.parsed.info.token_amount.amount)?;
        }
        Ok(from_base_units(total, asset.decimals)?)
    }

    async fn transfer(
        &self,
        from: KeyBranch,
        to: &str,
        asset: &AssetConfig,
        amount: Decimal,
    ) -> Result<String, ChainError> {
        let recipient = decode_pubkey(to)?;
        let key = self.signer()?.solana_key(from)?;
        let payer = key.pubkey();

        let instructions = match asset.contract.as_deref() {
            None => vec![system_transfer(&payer, &recipient, Self::lamports(amount)?)?],
            Some(mint) => {
                let mint = decode_pubkey(mint)?;
                let raw = u64::try_from(to_base_units(amount, asset.decimals)?).map_err(|_| {
                    ChainError::Parse(format!("{} {} out of range", amount, asset.symbol))
                })?;
                let decimals = u8::try_from(asset.decimals)
                    .map_err(|_| ChainError::Config(format!("{} decimals", asset.symbol)))?;
                vec![
                    create_associated_token_account_idempotent(&payer, &recipient, &mint)?,
                    token_transfer_checked(
                        &associated_token_address(&payer, &mint)?,
                        &mint,
                        &associated_token_address(&recipient, &mint)?,
                        &payer,
                        raw,
                        decimals,
                    )?,
                ]
            }
        };

        let blockhash = self.latest_blockhash().await?;
        let message = Message::compile(&payer, &instructions, blockhash)?;
        let (wire, signature) = message.sign(&key)?;
        drop(key);

        let sent: String = self
            .rpc
            .call(
                "sendTransaction",
                (
                    BASE64.encode(&wire),
                    json!({ "encoding": "base64", "preflightCommitment": "confirmed" }),
                ),
            )
            .await?;
        if sent != signature {
            warn!(chain = %self.config.chain, expected = %signature, got = %sent, "Node returned unexpected signature");
        }
        info!(
            chain = %self.config.chain,
            signature = %sent,
            to = %to,
            asset = %asset.symbol,
            %amount,
            "Transfer broadcast"
        );
        Ok(sent)
    }

    async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        let signature = base_tx_hash(tx_id);
        match tokio::time::timeout(timeout, self.poll_status(signature)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(chain = %self.config.chain, signature = %signature, "Confirmation wait timed out");
                Err(ChainError::Timeout(format!("status for {}", signature)))
            }
        }
    }

    fn vault_address(&self) -> Result<String, ChainError> {
        Ok(self
            .signer()?
            .address(self.config.chain.family(), KeyBranch::PayoutVault)?)
    }

    /// A system account may not be left with a non-zero balance below rent
    /// exemption. When the residue would be, drain the address instead.
    async fn native_sweep_amount(
        &self,
        source: &str,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<Decimal, ChainError> {
        let balance = self.native_balance(source).await?;
        let base_fee = from_base_units(LAMPORTS_PER_SIGNATURE as u128, SOL_DECIMALS)?;
        let send = amount - fee;
        let residual = balance - send - base_fee;
        if residual < Decimal::ZERO {
            return Err(ChainError::InsufficientFunds {
                required: send + base_fee,
                available: balance,
            });
        }
        if residual.is_zero() || residual >= self.rent_exempt_minimum(0).await? {
            return Ok(send);
        }

        let drained = balance - base_fee;
        debug!(
            chain = %self.config.chain,
            source = %source,
            %send,
            %drained,
            "Residue below rent exemption, draining address"
        );
        Ok(drained)
    }
}
