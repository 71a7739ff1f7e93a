use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CollaboratorError, PriceFeed};

/// Price table filled by the caller. Quotes are keyed by upper-case ticker.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceFeed {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prices<I, S>(prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: AsRef<str>,
    {
        let map = prices
            .into_iter()
            .map(|(ticker, price)| (ticker.as_ref().to_uppercase(), price))
            .collect();
        Self {
            prices: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn set_price(&self, ticker: &str, price: Decimal) {
        self.prices.write().await.insert(ticker.to_uppercase(), price);
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn get_price(&self, ticker: &str) -> Result<Decimal, CollaboratorError> {
        self.prices
            .read()
            .await
            .get(&ticker.to_uppercase())
            .copied()
            .ok_or_else(|| CollaboratorError::PriceUnavailable(ticker.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_prices() {
        let feed = StaticPriceFeed::with_prices([("abcd", dec!(2.00))]);
        assert_eq!(feed.get_price("ABCD").await.unwrap(), dec!(2.00));
        assert!(feed.get_price("ZZZZ").await.is_err());

        feed.set_price("zzzz", dec!(0.51)).await;
        assert_eq!(feed.get_price("zzzz").await.unwrap(), dec!(0.51));
    }
}
