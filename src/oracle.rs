//! Price oracle contract
//!
//! `price_of(asset, amount, chain) -> usd`. The oracle's internals live
//! outside this crate; only the static table implementation ships here.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::core_types::Chain;

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD value of `amount` units of `asset` on `chain`, or `None` when the
    /// asset cannot be priced right now.
    async fn price_of(&self, asset: &str, amount: Decimal, chain: Chain) -> Option<Decimal>;

    /// Unit price; payouts divide by this
    async fn unit_price(&self, asset: &str, chain: Chain) -> Option<Decimal> {
        self.price_of(asset, Decimal::ONE, chain)
            .await
            .filter(|p| *p > Decimal::ZERO)
    }
}

/// Fixed price table (symbols are case-insensitive)
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    prices: HashMap<String, Decimal>,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<String, Decimal>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
        }
    }

    pub fn set(&mut self, asset: &str, price: Decimal) {
        self.prices.insert(asset.to_uppercase(), price);
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn price_of(&self, asset: &str, amount: Decimal, _chain: Chain) -> Option<Decimal> {
        self.prices
            .get(&asset.to_uppercase())
            .map(|p| (*p * amount).round_dp(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_price() {
        let mut oracle = StaticPriceOracle::default();
        oracle.set("eth", Decimal::new(3000, 0));

        let usd = oracle
            .price_of("ETH", Decimal::new(5, 1), Chain::Base)
            .await
            .unwrap();
        assert_eq!(usd, Decimal::new(1500, 0));
        assert!(oracle.price_of("DOGE", Decimal::ONE, Chain::Base).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_unit_price_is_unresolved() {
        let mut oracle = StaticPriceOracle::default();
        oracle.set("RUG", Decimal::ZERO);
        assert!(oracle.unit_price("RUG", Chain::Ethereum).await.is_none());
    }
}
