//! Core types used throughout the system
//!
//! Identifier aliases and the chain enumeration shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User ID - owned by the surrounding account system, immutable.
pub type UserId = i64;

/// Primary key of a `deposits` row
pub type DepositId = i64;

/// Primary key of a `deposit_addresses` row
pub type DepositAddressId = i64;

/// Primary key of a `sweep_batches` row
pub type SweepBatchId = i64;

/// Primary key of a `payouts` row
pub type PayoutId = i64;

/// Primary key of a campaign participant (external)
pub type ParticipantId = i64;

/// HD derivation index (non-hardened range for EVM, hardened for Solana)
pub type DerivationIndex = u32;

/// Address family. All EVM-family chains share one derived address per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Solana,
}

impl ChainFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Solana => "solana",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watched chains.
///
/// Adding a chain means adding a variant here and configuring an adapter for
/// its family; nothing else branches on the concrete chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Base,
    Arbitrum,
    Optimism,
    Polygon,
    Bsc,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 7] = [
        Chain::Ethereum,
        Chain::Base,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Polygon,
        Chain::Bsc,
        Chain::Solana,
    ];

    #[inline]
    pub fn family(&self) -> ChainFamily {
        match self {
            Chain::Solana => ChainFamily::Solana,
            _ => ChainFamily::Evm,
        }
    }

    #[inline]
    pub fn is_evm(&self) -> bool {
        self.family() == ChainFamily::Evm
    }

    /// EIP-155 chain id for EVM chains
    pub fn default_evm_chain_id(&self) -> Option<u64> {
        match self {
            Chain::Ethereum => Some(1),
            Chain::Base => Some(8453),
            Chain::Arbitrum => Some(42161),
            Chain::Optimism => Some(10),
            Chain::Polygon => Some(137),
            Chain::Bsc => Some(56),
            Chain::Solana => None,
        }
    }

    /// Symbol of the chain's fee-paying native asset
    pub fn native_symbol(&self) -> &'static str {
        match self {
            Chain::Ethereum | Chain::Base | Chain::Arbitrum | Chain::Optimism => "ETH",
            Chain::Polygon => "POL",
            Chain::Bsc => "BNB",
            Chain::Solana => "SOL",
        }
    }

    pub fn native_decimals(&self) -> u32 {
        match self {
            Chain::Solana => 9,
            _ => 18,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Polygon => "polygon",
            Chain::Bsc => "bsc",
            Chain::Solana => "solana",
        }
    }

    pub fn evm_chains() -> impl Iterator<Item = Chain> {
        Self::ALL.into_iter().filter(|c| c.is_evm())
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "base" => Ok(Chain::Base),
            "arbitrum" | "arb" => Ok(Chain::Arbitrum),
            "optimism" | "op" => Ok(Chain::Optimism),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "bsc" | "bnb" => Ok(Chain::Bsc),
            "solana" | "sol" => Ok(Chain::Solana),
            _ => Err(format!("Unknown chain: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_family() {
        assert!(Chain::Ethereum.is_evm());
        assert!(Chain::Bsc.is_evm());
        assert!(!Chain::Solana.is_evm());
        assert_eq!(Chain::Solana.family(), ChainFamily::Solana);
        assert_eq!(Chain::evm_chains().count(), 6);
    }

    #[test]
    fn test_chain_parse_roundtrip() {
        for chain in Chain::ALL {
            assert_eq!(Chain::from_str(chain.as_str()).unwrap(), chain);
        }
        assert_eq!(Chain::from_str("ETH").unwrap(), Chain::Ethereum);
        assert!(Chain::from_str("dogecoin").is_err());
    }

    #[test]
    fn test_chain_serde_lowercase() {
        let json = serde_json::to_string(&Chain::Arbitrum).unwrap();
        assert_eq!(json, "\"arbitrum\"");
        let chain: Chain = serde_json::from_str("\"solana\"").unwrap();
        assert_eq!(chain, Chain::Solana);
    }
}
