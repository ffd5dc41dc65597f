use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use thiserror::Error;

use crate::core_types::Chain;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL for the custody ledger
    #[serde(default)]
    pub postgres_url: Option<String>,
    pub custody: CustodyConfig,
}

/// Externally tunable knobs of the custody subsystem
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustodyConfig {
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub reorg: ReorgConfig,
    #[serde(default)]
    pub settlement: SettlementQueueConfig,
    /// Static USD prices keyed by asset symbol
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Environment variable holding the hex master seed
    #[serde(default = "default_master_seed_env")]
    pub master_seed_env: String,
}

fn default_master_seed_env() -> String {
    "CUSTODY_MASTER_SEED".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub chain: Chain,
    /// Missing URL disables the chain (with a warning)
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// EIP-155 id; defaults to the chain's mainnet id
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub confirmations: u32,
    #[serde(default)]
    pub min_sweep_usd: Decimal,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// First block to scan when no cursor exists and nothing is recorded yet
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Without `start_block` or recorded deposits, scanning starts this many
    /// blocks behind the head
    #[serde(default = "default_cold_start_lookback")]
    pub cold_start_lookback_blocks: u64,
    #[serde(default = "default_signature_page_size")]
    pub signature_page_size: usize,
    /// Skip a tick when the head block is older than this
    #[serde(default = "default_max_block_lag_secs")]
    pub max_block_lag_secs: i64,
    /// Legacy gas price override (gwei); otherwise `eth_gasPrice`
    #[serde(default)]
    pub gas_price_gwei: Option<Decimal>,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_max_block_range() -> u64 {
    500
}

fn default_cold_start_lookback() -> u64 {
    1_000
}

fn default_signature_page_size() -> usize {
    100
}

fn default_max_block_lag_secs() -> i64 {
    600
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AssetConfig {
    pub symbol: String,
    /// ERC-20 contract / SPL mint. `None` is the chain's native asset.
    #[serde(default)]
    pub contract: Option<String>,
    pub decimals: u32,
    /// Inbound transfers below this amount are ignored
    #[serde(default)]
    pub dust_threshold: Decimal,
    #[serde(default)]
    pub transfer_gas_limit: Option<u64>,
}

impl AssetConfig {
    pub fn is_native(&self) -> bool {
        self.contract.is_none()
    }

    pub fn native(chain: Chain, dust_threshold: Decimal) -> Self {
        Self {
            symbol: chain.native_symbol().to_string(),
            contract: None,
            decimals: chain.native_decimals(),
            dust_threshold,
            transfer_gas_limit: None,
        }
    }
}

impl ChainConfig {
    pub fn native_asset(&self) -> AssetConfig {
        self.assets
            .iter()
            .find(|a| a.is_native())
            .cloned()
            .unwrap_or_else(|| AssetConfig::native(self.chain, Decimal::ZERO))
    }

    pub fn token_assets(&self) -> impl Iterator<Item = &AssetConfig> {
        self.assets.iter().filter(|a| !a.is_native())
    }

    pub fn asset_by_symbol(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets
            .iter()
            .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
    }

    /// Case-insensitive for EVM hex contracts; Solana mints are exact base58
    pub fn asset_by_contract(&self, contract: &str) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| match &a.contract {
            Some(c) if self.chain.is_evm() => c.eq_ignore_ascii_case(contract),
            Some(c) => c == contract,
            None => false,
        })
    }

    /// Per-(chain, asset) dust threshold; unknown assets are never dust
    pub fn dust_threshold(&self, symbol: &str) -> Decimal {
        self.asset_by_symbol(symbol)
            .map(|a| a.dust_threshold)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn evm_chain_id(&self) -> Option<u64> {
        self.chain_id.or_else(|| self.chain.default_evm_chain_id())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SweepConfig {
    /// Max deposits per batch
    pub batch_size: usize,
    /// Applied to estimated network fees
    pub fee_multiplier: Decimal,
    pub interval_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            fee_multiplier: Decimal::new(12, 1),
            interval_ms: 600_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReorgConfig {
    pub interval_ms: u64,
    /// Trailing window for re-checking already-credited deposits
    pub credited_window_secs: i64,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            credited_window_secs: 3600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettlementQueueConfig {
    /// Local kill switch, OR-ed with the ledger's active settlement config
    pub paused: bool,
    pub batch_limit: usize,
    pub inter_payout_delay_ms: u64,
    pub interval_ms: u64,
    pub preferred_wallet_type: String,
    pub fallback_wallet_type: String,
    pub confirmation_timeout_secs: u64,
    /// EXECUTING longer than this is treated as an interrupted payout
    #[serde(default = "default_stuck_payout_secs")]
    pub stuck_payout_secs: u64,
}

fn default_stuck_payout_secs() -> u64 {
    3600
}

impl Default for SettlementQueueConfig {
    fn default() -> Self {
        Self {
            paused: false,
            batch_limit: 20,
            inter_payout_delay_ms: 2_000,
            interval_ms: 300_000,
            preferred_wallet_type: "external".to_string(),
            fallback_wallet_type: "embedded".to_string(),
            confirmation_timeout_secs: 120,
            stuck_payout_secs: default_stuck_payout_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AlertConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        Self::from_file(&config_path)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.custody.validate()?;
        Ok(config)
    }
}

impl CustodyConfig {
    pub fn chain(&self, chain: Chain) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain == chain)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for c in &self.chains {
            if !seen.insert(c.chain) {
                return Err(ConfigError::Invalid(format!(
                    "chain {} configured twice",
                    c.chain
                )));
            }
            if c.confirmations == 0 {
                return Err(ConfigError::Invalid(format!(
                    "chain {}: confirmations must be > 0",
                    c.chain
                )));
            }
            if c.assets.iter().filter(|a| a.is_native()).count() > 1 {
                return Err(ConfigError::Invalid(format!(
                    "chain {}: more than one native asset",
                    c.chain
                )));
            }
        }
        if self.sweep.fee_multiplier < Decimal::ONE {
            return Err(ConfigError::Invalid(
                "sweep.fee_multiplier must be >= 1".to_string(),
            ));
        }
        if self.sweep.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sweep.batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
log_level: "info"
log_dir: "./logs"
log_file: "custody.log"
use_json: false
rotation: "daily"
postgres_url: "postgres://localhost/custody"
custody:
  chains:
    - chain: ethereum
      rpc_url: "http://127.0.0.1:8545"
      confirmations: 12
      min_sweep_usd: "50"
      assets:
        - symbol: ETH
          decimals: 18
          dust_threshold: "0.0005"
        - symbol: USDC
          contract: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
          decimals: 6
          dust_threshold: "1"
    - chain: solana
      confirmations: 32
      assets:
        - symbol: SOL
          decimals: 9
          dust_threshold: "0.01"
  sweep:
    batch_size: 25
    fee_multiplier: "1.5"
    interval_ms: 60000
  prices:
    ETH: "3000"
    USDC: "1"
"#;

    #[test]
    fn test_config_deserialize() {
        let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.custody.chains.len(), 2);
        assert_eq!(config.custody.sweep.batch_size, 25);
        assert_eq!(config.custody.sweep.fee_multiplier, Decimal::new(15, 1));
        // Defaults
        assert_eq!(config.custody.reorg.credited_window_secs, 3600);
        assert_eq!(config.custody.master_seed_env, "CUSTODY_MASTER_SEED");
        assert!(config.custody.validate().is_ok());
    }

    #[test]
    fn test_missing_rpc_url_is_not_an_error() {
        let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        let sol = config.custody.chain(Chain::Solana).unwrap();
        assert!(sol.rpc_url.is_none());
        assert_eq!(sol.poll_interval_ms, 15_000);
    }

    #[test]
    fn test_asset_lookup() {
        let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        let eth = config.custody.chain(Chain::Ethereum).unwrap();
        assert_eq!(eth.native_asset().symbol, "ETH");
        assert_eq!(eth.token_assets().count(), 1);
        assert_eq!(eth.dust_threshold("usdc"), Decimal::ONE);
        assert_eq!(eth.dust_threshold("DAI"), Decimal::ZERO);
        assert!(eth
            .asset_by_contract("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
            .is_some());
        assert_eq!(eth.evm_chain_id(), Some(1));
    }

    #[test]
    fn test_validate_rejects_duplicate_chain() {
        let mut config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        let dup = config.custody.chains[0].clone();
        config.custody.chains.push(dup);
        assert!(config.custody.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_low_fee_multiplier() {
        let mut config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        config.custody.sweep.fee_multiplier = Decimal::new(9, 1);
        assert!(config.custody.validate().is_err());
    }
}
