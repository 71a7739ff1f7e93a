use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use super::aggregator::{AccountEntry, FetchStatus, PortfolioAggregator};
use super::error::{AggregatorError, ProjectionError};
use crate::brokerage::{normalize_ticker, BrokerageId};
use crate::market::PriceFeed;
use crate::trading::fanout::CancelSignal;

pub const CASH_IN_LIEU_CAVEAT: &str = "Projection assumes every fractional post-split share is cashed out \
at today's price. Brokers may instead round up to a whole share or pay cash in lieu at a different price.";

/// Effect of a reverse split on one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitOutcome {
    /// Whole post-split shares kept: floor(quantity / ratio).
    pub retained_shares: Decimal,
    /// Pre-split shares left over and assumed cashed out.
    pub remainder_shares: Decimal,
    pub projected_gain: Decimal,
}

impl SplitOutcome {
    const NONE: SplitOutcome = SplitOutcome {
        retained_shares: Decimal::ZERO,
        remainder_shares: Decimal::ZERO,
        projected_gain: Decimal::ZERO,
    };
}

impl std::iter::Sum for SplitOutcome {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(SplitOutcome::NONE, |total, o| SplitOutcome {
            retained_shares: total.retained_shares + o.retained_shares,
            remainder_shares: total.remainder_shares + o.remainder_shares,
            projected_gain: total.projected_gain + o.projected_gain,
        })
    }
}

/// `quantity` pre-split shares through a 1-for-`ratio` reverse split at
/// `price`. Non-positive quantities project to nothing.
pub fn project_split(quantity: Decimal, ratio: Decimal, price: Decimal) -> Result<SplitOutcome, ProjectionError> {
    if ratio <= Decimal::ZERO {
        return Err(ProjectionError::InvalidSplitRatio(ratio));
    }
    if quantity <= Decimal::ZERO {
        return Ok(SplitOutcome::NONE);
    }

    let retained_shares = (quantity / ratio).floor();
    let remainder_shares = quantity - retained_shares * ratio;
    Ok(SplitOutcome {
        retained_shares,
        remainder_shares,
        projected_gain: remainder_shares * price,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionEntry {
    pub identity: BrokerageId,
    pub status: FetchStatus,
    pub quantity: Option<Decimal>,
    /// Sum of the per-account outcomes. Each account is split on its own,
    /// so remainders are not pooled across accounts.
    pub outcome: Option<SplitOutcome>,
    pub detail: Option<String>,
    pub accounts: Vec<AccountEntry<SplitOutcome>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectionReport {
    pub ticker: String,
    pub split_ratio: Decimal,
    pub price: Decimal,
    pub entries: Vec<ProjectionEntry>,
    /// Sum over entries whose position could be read.
    pub total_gain: Decimal,
    pub requested: usize,
    pub succeeded: usize,
    pub partial: bool,
    pub caveat: String,
}

pub struct ProfitProjectionCalculator {
    aggregator: Arc<PortfolioAggregator>,
    price_feed: Arc<dyn PriceFeed>,
}

impl ProfitProjectionCalculator {
    pub fn new(aggregator: Arc<PortfolioAggregator>, price_feed: Arc<dyn PriceFeed>) -> Self {
        Self {
            aggregator,
            price_feed,
        }
    }

    pub async fn project(
        &self,
        ticker: &str,
        split_ratio: Decimal,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
    ) -> Result<ProjectionReport, ProjectionError> {
        if split_ratio <= Decimal::ZERO {
            return Err(ProjectionError::InvalidSplitRatio(split_ratio));
        }
        let ticker = normalize_ticker(ticker).ok_or(AggregatorError::InvalidTicker)?;
        let price = self.price_feed.get_price(&ticker).await?;

        let positions = self.aggregator.get_positions(&ticker, targets, cancel).await?;

        let mut entries = Vec::with_capacity(positions.entries.len());
        for position in positions.entries {
            let mut accounts = Vec::with_capacity(position.accounts.len());
            for account in position.accounts {
                let outcome = account
                    .value
                    .map(|quantity| project_split(quantity, split_ratio, price))
                    .transpose()?;
                accounts.push(AccountEntry {
                    account: account.account,
                    status: account.status,
                    value: outcome,
                    detail: account.detail,
                });
            }
            let outcome = (position.status == FetchStatus::Succeeded)
                .then(|| accounts.iter().filter_map(|a| a.value).sum::<SplitOutcome>());
            entries.push(ProjectionEntry {
                identity: position.identity,
                status: position.status,
                quantity: position.quantity,
                outcome,
                detail: position.detail,
                accounts,
            });
        }

        let total_gain = entries
            .iter()
            .filter_map(|e| e.outcome.map(|o| o.projected_gain))
            .sum::<Decimal>();

        tracing::info!(
            "📈 {} 1-for-{} reverse split at ${}: projected gain ${} across {}/{} brokerages",
            ticker,
            split_ratio,
            price,
            total_gain,
            positions.succeeded,
            positions.requested
        );

        Ok(ProjectionReport {
            ticker,
            split_ratio,
            price,
            entries,
            total_gain,
            requested: positions.requested,
            succeeded: positions.succeeded,
            partial: positions.partial,
            caveat: CASH_IN_LIEU_CAVEAT.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokerage::{BrokerageError, Credentials, PaperBrokerageClient, RegistryBuilder};
    use crate::brokerage::client::BrokerageClient;
    use crate::core::config::PortfolioConfig;
    use crate::limits::RateLimiterSet;
    use crate::market::{CollaboratorError, StaticPriceFeed};
    use rust_decimal_macros::dec;

    #[test]
    fn test_split_math() {
        let outcome = project_split(dec!(10), dec!(4), dec!(2.00)).unwrap();
        assert_eq!(outcome.retained_shares, dec!(2));
        assert_eq!(outcome.remainder_shares, dec!(2));
        assert_eq!(outcome.projected_gain, dec!(4.00));

        let exact = project_split(dec!(8), dec!(4), dec!(2.00)).unwrap();
        assert_eq!(exact.remainder_shares, Decimal::ZERO);

        let below_ratio = project_split(dec!(1), dec!(10), dec!(0.50)).unwrap();
        assert_eq!(below_ratio.retained_shares, Decimal::ZERO);
        assert_eq!(below_ratio.projected_gain, dec!(0.50));

        assert_eq!(
            project_split(dec!(1), Decimal::ZERO, dec!(1)),
            Err(ProjectionError::InvalidSplitRatio(Decimal::ZERO))
        );
    }

    async fn calculator(clients: Vec<PaperBrokerageClient>, feed: StaticPriceFeed) -> ProfitProjectionCalculator {
        let mut builder = RegistryBuilder::new();
        for client in clients {
            client.authenticate(&Credentials::new()).await.unwrap();
            builder.add(Arc::new(client)).unwrap();
        }
        let aggregator = PortfolioAggregator::new(
            Arc::new(builder.build()),
            Arc::new(RateLimiterSet::default()),
            PortfolioConfig::default(),
        );
        ProfitProjectionCalculator::new(Arc::new(aggregator), Arc::new(feed))
    }

    #[tokio::test]
    async fn test_projection_across_brokerages() {
        let calculator = calculator(
            vec![
                PaperBrokerageClient::new(BrokerageId::Schwab).with_position("ABCD", dec!(10)),
                PaperBrokerageClient::new(BrokerageId::Public).with_position("ABCD", dec!(1)),
                PaperBrokerageClient::new(BrokerageId::Tradier)
                    .fail_holdings(BrokerageError::AuthExpired("logged out".into())),
            ],
            StaticPriceFeed::with_prices([("ABCD", dec!(2.00))]),
        )
        .await;

        let report = calculator
            .project("abcd", dec!(4), None, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.total_gain, dec!(6.00));
        assert!(report.partial);
        assert!(!report.caveat.is_empty());
        let tradier = report.entries.iter().find(|e| e.identity == BrokerageId::Tradier).unwrap();
        assert!(tradier.outcome.is_none());
    }

    #[tokio::test]
    async fn test_split_applies_per_account() {
        let calculator = calculator(
            vec![PaperBrokerageClient::new(BrokerageId::Fennel)
                .with_accounts(2)
                .with_position("ABCD", dec!(3))],
            StaticPriceFeed::with_prices([("ABCD", dec!(1.00))]),
        )
        .await;

        let report = calculator
            .project("ABCD", dec!(4), None, &CancelSignal::never())
            .await
            .unwrap();

        let fennel = &report.entries[0];
        assert_eq!(fennel.quantity, Some(dec!(6)));
        assert_eq!(fennel.accounts.len(), 2);
        let outcome = fennel.outcome.unwrap();
        assert_eq!(outcome.retained_shares, Decimal::ZERO);
        assert_eq!(outcome.remainder_shares, dec!(6));
        assert_eq!(report.total_gain, dec!(6.00));
    }

    #[tokio::test]
    async fn test_projection_rejects_bad_inputs() {
        let calculator = calculator(
            vec![PaperBrokerageClient::new(BrokerageId::Schwab)],
            StaticPriceFeed::new(),
        )
        .await;
        let cancel = CancelSignal::never();

        assert_eq!(
            calculator.project("ABCD", dec!(-2), None, &cancel).await.err(),
            Some(ProjectionError::InvalidSplitRatio(dec!(-2)))
        );
        assert_eq!(
            calculator.project("ABCD", dec!(4), None, &cancel).await.err(),
            Some(ProjectionError::Price(CollaboratorError::PriceUnavailable("ABCD".into())))
        );
        assert_eq!(
            calculator.project("", dec!(4), None, &cancel).await.err(),
            Some(ProjectionError::Portfolio(AggregatorError::InvalidTicker))
        );
    }
}
