use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::error::AggregatorError;
use crate::brokerage::{
    merge_holdings, normalize_ticker, position_of, AccountId, BrokerageClient, BrokerageError,
    BrokerageId, ClientRegistry, Holdings,
};
use crate::core::config::PortfolioConfig;
use crate::limits::{RateLimiter, RateLimiterSet};
use crate::trading::fanout::{accounts_for, fan_out, within, CancelSignal, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchStatus {
    Succeeded,
    Failed,
    /// The backend does not offer this read.
    Skipped,
}

/// One account's answer to a read.
#[derive(Debug, Clone, Serialize)]
pub struct AccountEntry<T> {
    pub account: AccountId,
    pub status: FetchStatus,
    pub value: Option<T>,
    pub detail: Option<String>,
}

impl<T> AccountEntry<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AccountEntry<U> {
        AccountEntry {
            account: self.account,
            status: self.status,
            value: self.value.map(f),
            detail: self.detail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceEntry {
    pub identity: BrokerageId,
    pub status: FetchStatus,
    /// Subtotal over this brokerage's accounts. Only set when every
    /// account answered.
    pub balance: Option<Decimal>,
    pub detail: Option<String>,
    pub accounts: Vec<AccountEntry<Decimal>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub entries: Vec<BalanceEntry>,
    /// Sum over succeeded entries only.
    pub total: Decimal,
    pub requested: usize,
    pub succeeded: usize,
    /// Accounts behind `total`.
    pub accounts: usize,
    /// Set whenever some requested brokerage did not contribute.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingsEntry {
    pub identity: BrokerageId,
    pub status: FetchStatus,
    /// This brokerage's accounts combined.
    pub holdings: Option<Holdings>,
    pub detail: Option<String>,
    pub accounts: Vec<AccountEntry<Holdings>>,
}

/// Per-brokerage holdings. Never merged across brokerages.
#[derive(Debug, Clone, Serialize)]
pub struct HoldingsReport {
    pub entries: Vec<HoldingsEntry>,
    pub requested: usize,
    pub succeeded: usize,
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionEntry {
    pub identity: BrokerageId,
    pub status: FetchStatus,
    /// Zero when the brokerage answered but does not hold the ticker.
    pub quantity: Option<Decimal>,
    pub detail: Option<String>,
    pub accounts: Vec<AccountEntry<Decimal>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionReport {
    pub ticker: String,
    pub entries: Vec<PositionEntry>,
    pub total_quantity: Decimal,
    pub requested: usize,
    pub succeeded: usize,
    pub partial: bool,
}

enum Fetched<T> {
    Value(T),
    Skipped(String),
    Failed(String),
}

impl<T> Fetched<T> {
    fn from_result(result: Result<T, BrokerageError>) -> Self {
        match result {
            Ok(value) => Fetched::Value(value),
            Err(e) if e.is_unsupported() => Fetched::Skipped(e.to_string()),
            Err(e) => Fetched::Failed(e.to_string()),
        }
    }

    fn into_entry(self, account: AccountId) -> AccountEntry<T> {
        let (status, value, detail) = match self {
            Fetched::Value(value) => (FetchStatus::Succeeded, Some(value), None),
            Fetched::Skipped(detail) => (FetchStatus::Skipped, None, Some(detail)),
            Fetched::Failed(detail) => (FetchStatus::Failed, None, Some(detail)),
        };
        AccountEntry {
            account,
            status,
            value,
            detail,
        }
    }
}

/// A brokerage's task result before it is rolled up.
enum BrokerageRead<T> {
    Accounts(Vec<AccountEntry<T>>),
    Skipped(String),
    Failed(String),
}

/// One brokerage's read after roll-up. Succeeded when no account failed
/// and at least one answered; skipped accounts do not contribute.
struct Settled<T> {
    identity: BrokerageId,
    status: FetchStatus,
    detail: Option<String>,
    accounts: Vec<AccountEntry<T>>,
}

impl<T> Settled<T> {
    fn new(identity: BrokerageId, read: BrokerageRead<T>) -> Self {
        let (status, detail, accounts) = match read {
            BrokerageRead::Skipped(detail) => (FetchStatus::Skipped, Some(detail), Vec::new()),
            BrokerageRead::Failed(detail) => (FetchStatus::Failed, Some(detail), Vec::new()),
            BrokerageRead::Accounts(accounts) => {
                let count = |status| accounts.iter().filter(|a| a.status == status).count();
                let (answered, failed) = (count(FetchStatus::Succeeded), count(FetchStatus::Failed));
                if accounts.is_empty() {
                    (FetchStatus::Skipped, Some("no accounts found".to_string()), accounts)
                } else if failed > 0 {
                    let detail = match accounts.as_slice() {
                        [only] => only.detail.clone(),
                        _ => Some(format!("{}/{} accounts answered", answered, accounts.len())),
                    };
                    (FetchStatus::Failed, detail, accounts)
                } else if answered == 0 {
                    let detail = accounts.iter().find_map(|a| a.detail.clone());
                    (FetchStatus::Skipped, detail, accounts)
                } else {
                    (FetchStatus::Succeeded, None, accounts)
                }
            }
        };
        Self {
            identity,
            status,
            detail,
            accounts,
        }
    }

    /// Answered values, present only when the brokerage as a whole succeeded.
    fn values(&self) -> Option<impl Iterator<Item = &T>> {
        (self.status == FetchStatus::Succeeded).then(|| self.accounts.iter().filter_map(|a| a.value.as_ref()))
    }
}

/// Read-only fan-out over the authenticated brokerages and each of their
/// accounts.
pub struct PortfolioAggregator {
    registry: Arc<ClientRegistry>,
    limiters: Arc<RateLimiterSet>,
    config: PortfolioConfig,
}

impl PortfolioAggregator {
    pub fn new(registry: Arc<ClientRegistry>, limiters: Arc<RateLimiterSet>, config: PortfolioConfig) -> Self {
        Self {
            registry,
            limiters,
            config,
        }
    }

    pub async fn get_balances(
        &self,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
    ) -> Result<BalanceReport, AggregatorError> {
        let settled = self
            .read_all(targets, cancel, |client, account| async move {
                client.get_balance(&account).await
            })
            .await?;

        let entries: Vec<BalanceEntry> = settled
            .into_iter()
            .map(|read| {
                let balance = read.values().map(|values| values.copied().sum::<Decimal>());
                if let Some(subtotal) = balance {
                    tracing::info!(
                        "💰 {} balance ${} across {} accounts",
                        read.identity,
                        subtotal,
                        read.accounts.len()
                    );
                }
                BalanceEntry {
                    identity: read.identity,
                    status: read.status,
                    balance,
                    detail: read.detail,
                    accounts: read.accounts,
                }
            })
            .collect();

        let total = entries.iter().filter_map(|e| e.balance).sum::<Decimal>();
        let requested = entries.len();
        let contributing = entries.iter().filter(|e| e.status == FetchStatus::Succeeded);
        let succeeded = contributing.clone().count();
        let accounts = contributing
            .flat_map(|e| &e.accounts)
            .filter(|a| a.status == FetchStatus::Succeeded)
            .count();

        if succeeded < requested {
            tracing::warn!(
                "💰 Partial balance total ${} ({}/{} brokerages answered)",
                total,
                succeeded,
                requested
            );
        } else {
            tracing::info!(
                "💰 Total balance across {} brokerages ({} accounts): ${}",
                requested,
                accounts,
                total
            );
        }

        Ok(BalanceReport {
            entries,
            total,
            requested,
            succeeded,
            accounts,
            partial: succeeded < requested,
        })
    }

    pub async fn get_holdings(
        &self,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
    ) -> Result<HoldingsReport, AggregatorError> {
        let settled = self
            .read_all(targets, cancel, |client, account| async move {
                client.get_holdings(&account).await
            })
            .await?;

        let entries: Vec<HoldingsEntry> = settled
            .into_iter()
            .map(|read| {
                let holdings = read.values().map(|values| {
                    values.fold(Holdings::new(), |mut combined, held| {
                        merge_holdings(&mut combined, held);
                        combined
                    })
                });
                HoldingsEntry {
                    identity: read.identity,
                    status: read.status,
                    holdings,
                    detail: read.detail,
                    accounts: read.accounts,
                }
            })
            .collect();

        let requested = entries.len();
        let succeeded = entries
            .iter()
            .filter(|e| e.status == FetchStatus::Succeeded)
            .count();
        tracing::info!("📦 Holdings fetched from {}/{} brokerages", succeeded, requested);

        Ok(HoldingsReport {
            entries,
            requested,
            succeeded,
            partial: succeeded < requested,
        })
    }

    /// Quantity of one ticker at each brokerage, with each account's share.
    pub async fn get_positions(
        &self,
        ticker: &str,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
    ) -> Result<PositionReport, AggregatorError> {
        let ticker = normalize_ticker(ticker).ok_or(AggregatorError::InvalidTicker)?;
        let holdings = self.get_holdings(targets, cancel).await?;

        let entries: Vec<PositionEntry> = holdings
            .entries
            .into_iter()
            .map(|entry| PositionEntry {
                identity: entry.identity,
                status: entry.status,
                quantity: entry.holdings.as_ref().map(|h| position_of(h, &ticker)),
                detail: entry.detail,
                accounts: entry
                    .accounts
                    .into_iter()
                    .map(|a| a.map(|h| position_of(&h, &ticker)))
                    .collect(),
            })
            .collect();
        let total_quantity = entries.iter().filter_map(|e| e.quantity).sum::<Decimal>();

        Ok(PositionReport {
            ticker,
            entries,
            total_quantity,
            requested: holdings.requested,
            succeeded: holdings.succeeded,
            partial: holdings.partial,
        })
    }

    /// One limited read per account of each targeted brokerage. Accounts of
    /// one brokerage share its limiter. A dropped connection is retried
    /// once; timeouts, cancellation and other errors become Failed.
    async fn read_all<T, F, Fut>(
        &self,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
        read: F,
    ) -> Result<Vec<Settled<T>>, AggregatorError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn BrokerageClient>, AccountId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BrokerageError>> + Send + 'static,
    {
        let selected = self.registry.select(targets)?;
        if selected.is_empty() {
            return Err(AggregatorError::NoUsableClients);
        }

        let limiters = self.limiters.clone();
        let read = Arc::new(read);
        let call_timeout = self.config.read_timeout();
        let client_timeout = self.config.client_timeout();

        let outcomes = fan_out(selected, client_timeout, cancel, move |identity, handle| {
            let limiter = limiters.get(identity);
            let read = read.clone();
            async move {
                let accounts = match accounts_for(&handle, &limiter, call_timeout).await {
                    Ok(accounts) => accounts,
                    Err(e) if e.is_unsupported() => return BrokerageRead::Skipped(e.to_string()),
                    Err(e) => return BrokerageRead::Failed(format!("account lookup failed: {}", e)),
                };
                let client = handle.client();
                let reads = accounts.into_iter().map(|account| {
                    let (client, limiter, read) = (client.clone(), limiter.clone(), read.clone());
                    async move {
                        let fetched = read_account(identity, &account, &limiter, call_timeout, || {
                            (*read)(client.clone(), account.clone())
                        })
                        .await;
                        fetched.into_entry(account)
                    }
                });
                BrokerageRead::Accounts(join_all(reads).await)
            }
        })
        .await;

        Ok(outcomes
            .into_iter()
            .map(|(identity, outcome)| {
                let read = match outcome {
                    TaskOutcome::Completed(read) => read,
                    TaskOutcome::TimedOut => {
                        BrokerageRead::Failed(format!("no response within {}s", client_timeout.as_secs()))
                    }
                    TaskOutcome::Cancelled => BrokerageRead::Failed("cancelled".to_string()),
                    TaskOutcome::Panicked(reason) => BrokerageRead::Failed(format!("task panicked: {}", reason)),
                };
                let settled = Settled::new(identity, read);
                if let Some(detail) = settled.detail.as_deref().filter(|_| settled.status == FetchStatus::Failed) {
                    tracing::error!("❌ {} read failed: {}", identity, detail);
                }
                settled
            })
            .collect())
    }
}

async fn read_account<T, F, Fut>(
    identity: BrokerageId,
    account: &AccountId,
    limiter: &RateLimiter,
    limit: Duration,
    mut read: F,
) -> Fetched<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerageError>>,
{
    let result = match limiter.run(|| within(limit, read())).await {
        Err(BrokerageError::Network(e)) => {
            tracing::warn!("🔄 {} [{}] read failed ({}), retrying once", identity, account, e);
            limiter.run(|| within(limit, read())).await
        }
        other => other,
    };
    Fetched::from_result(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokerage::{Credentials, PaperBrokerageClient, RegistryBuilder};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn aggregator(clients: Vec<PaperBrokerageClient>) -> PortfolioAggregator {
        let mut builder = RegistryBuilder::new();
        for client in clients {
            client.authenticate(&Credentials::new()).await.unwrap();
            builder.add(Arc::new(client)).unwrap();
        }
        PortfolioAggregator::new(
            Arc::new(builder.build()),
            Arc::new(RateLimiterSet::default()),
            PortfolioConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_total_counts_only_successes() {
        let aggregator = aggregator(vec![
            PaperBrokerageClient::new(BrokerageId::Schwab).with_cash(dec!(100.50)),
            PaperBrokerageClient::new(BrokerageId::Public).with_cash(dec!(20)),
            PaperBrokerageClient::new(BrokerageId::Bbae)
                .with_cash(dec!(1000))
                .fail_balance(BrokerageError::AuthExpired("logged out".into())),
        ])
        .await;

        let report = aggregator.get_balances(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.total, dec!(120.50));
        assert_eq!(report.succeeded, 2);
        assert!(report.partial);
        let bbae = report.entries.iter().find(|e| e.identity == BrokerageId::Bbae).unwrap();
        assert_eq!(bbae.status, FetchStatus::Failed);
        assert!(bbae.balance.is_none());
    }

    #[tokio::test]
    async fn test_complete_report_is_not_partial() {
        let aggregator = aggregator(vec![
            PaperBrokerageClient::new(BrokerageId::Schwab).with_cash(dec!(1)),
            PaperBrokerageClient::new(BrokerageId::Tradier).with_cash(dec!(2)),
        ])
        .await;

        let report = aggregator
            .get_balances(Some(&[BrokerageId::Tradier]), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(report.requested, 1);
        assert_eq!(report.total, dec!(2));
        assert!(!report.partial);
    }

    #[tokio::test]
    async fn test_balances_subtotal_per_brokerage() {
        let aggregator = aggregator(vec![
            PaperBrokerageClient::new(BrokerageId::Schwab).with_cash(dec!(10)).with_accounts(2),
            PaperBrokerageClient::new(BrokerageId::Public).with_cash(dec!(5)),
        ])
        .await;

        let report = aggregator.get_balances(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.total, dec!(25));
        assert_eq!(report.accounts, 3);
        assert!(!report.partial);
        let schwab = report.entries.iter().find(|e| e.identity == BrokerageId::Schwab).unwrap();
        assert_eq!(schwab.balance, Some(dec!(20)));
        assert_eq!(schwab.accounts.len(), 2);
        assert!(schwab.accounts.iter().all(|a| a.value == Some(dec!(10))));
    }

    #[tokio::test]
    async fn test_one_failed_account_fails_the_brokerage() {
        let aggregator = aggregator(vec![
            PaperBrokerageClient::new(BrokerageId::Fennel)
                .with_cash(dec!(10))
                .with_accounts(2)
                .fail_balance(BrokerageError::AuthExpired("logged out".into())),
            PaperBrokerageClient::new(BrokerageId::Tradier).with_cash(dec!(3)),
        ])
        .await;

        let report = aggregator.get_balances(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.total, dec!(3));
        assert_eq!(report.accounts, 1);
        assert!(report.partial);
        let fennel = report.entries.iter().find(|e| e.identity == BrokerageId::Fennel).unwrap();
        assert_eq!(fennel.status, FetchStatus::Failed);
        assert!(fennel.balance.is_none());
        assert_eq!(fennel.detail.as_deref(), Some("1/2 accounts answered"));
        let answered = fennel.accounts.iter().filter(|a| a.status == FetchStatus::Succeeded).count();
        assert_eq!(answered, 1);
    }

    #[tokio::test]
    async fn test_brokerage_without_accounts_is_skipped() {
        let aggregator = aggregator(vec![PaperBrokerageClient::new(BrokerageId::Bbae).with_accounts(0)]).await;

        let report = aggregator.get_balances(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.entries[0].status, FetchStatus::Skipped);
        assert_eq!(report.entries[0].detail.as_deref(), Some("no accounts found"));
        assert!(report.partial);
    }

    #[tokio::test]
    async fn test_holdings_merge_within_a_brokerage() {
        let aggregator = aggregator(vec![PaperBrokerageClient::new(BrokerageId::Fennel)
            .with_accounts(3)
            .with_position_in(1, "ABCD", dec!(2))
            .with_position_in(3, "ABCD", dec!(5))
            .with_position_in(3, "WXYZ", dec!(1))])
        .await;

        let holdings = aggregator.get_holdings(None, &CancelSignal::never()).await.unwrap();
        let combined = holdings.entries[0].holdings.as_ref().unwrap();
        assert_eq!(combined["ABCD"], dec!(7));
        assert_eq!(combined["WXYZ"], dec!(1));
        assert_eq!(holdings.entries[0].accounts.len(), 3);

        let positions = aggregator
            .get_positions("ABCD", None, &CancelSignal::never())
            .await
            .unwrap();
        let per_account: Vec<_> = positions.entries[0].accounts.iter().map(|a| a.value).collect();
        assert_eq!(per_account, vec![Some(dec!(2)), Some(Decimal::ZERO), Some(dec!(5))]);
        assert_eq!(positions.total_quantity, dec!(7));
    }

    #[tokio::test]
    async fn test_network_read_retried_once() {
        let client = PaperBrokerageClient::new(BrokerageId::Fennel)
            .with_cash(dec!(5))
            .fail_balance(BrokerageError::Network("reset".into()));
        let stats = client.stats();
        let aggregator = aggregator(vec![client]).await;

        let report = aggregator.get_balances(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.total, dec!(5));
        assert_eq!(stats.balances(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_is_failed_entry() {
        let aggregator = aggregator(vec![
            PaperBrokerageClient::new(BrokerageId::Robinhood).with_position("ABCD", dec!(3)),
            PaperBrokerageClient::new(BrokerageId::Dspac).with_latency(Duration::from_secs(60)),
        ])
        .await;

        let report = aggregator.get_holdings(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.succeeded, 1);
        assert!(report.partial);
        let dspac = report.entries.iter().find(|e| e.identity == BrokerageId::Dspac).unwrap();
        assert_eq!(dspac.status, FetchStatus::Failed);
    }

    #[tokio::test]
    async fn test_holdings_stay_per_brokerage() {
        let aggregator = aggregator(vec![
            PaperBrokerageClient::new(BrokerageId::Schwab).with_position("ABCD", dec!(3)),
            PaperBrokerageClient::new(BrokerageId::Public).with_position("ABCD", dec!(7)),
        ])
        .await;

        let report = aggregator.get_holdings(None, &CancelSignal::never()).await.unwrap();

        assert_eq!(report.entries.len(), 2);
        for entry in &report.entries {
            assert_eq!(entry.holdings.as_ref().unwrap().len(), 1);
        }

        let positions = aggregator
            .get_positions("abcd", None, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(positions.ticker, "ABCD");
        assert_eq!(positions.total_quantity, dec!(10));

        let none = aggregator
            .get_positions("WXYZ", Some(&[BrokerageId::Public]), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(none.entries[0].quantity, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_unsupported_read_is_skipped() {
        let aggregator = aggregator(vec![PaperBrokerageClient::new(BrokerageId::Dspac).fail_holdings(
            BrokerageError::Unsupported {
                identity: BrokerageId::Dspac,
                operation: "get_holdings",
            },
        )])
        .await;

        let report = aggregator.get_holdings(None, &CancelSignal::never()).await.unwrap();
        assert_eq!(report.entries[0].status, FetchStatus::Skipped);
        assert!(report.partial);
    }

    #[tokio::test]
    async fn test_rejects_unknown_targets() {
        let aggregator = aggregator(vec![PaperBrokerageClient::new(BrokerageId::Schwab)]).await;
        let cancel = CancelSignal::never();

        assert_eq!(
            aggregator
                .get_balances(Some(&[BrokerageId::Fennel]), &cancel)
                .await
                .err(),
            Some(AggregatorError::UnknownClient(BrokerageId::Fennel))
        );
        assert_eq!(
            aggregator.get_holdings(Some(&[]), &cancel).await.err(),
            Some(AggregatorError::NoUsableClients)
        );
        assert_eq!(
            aggregator.get_positions(" ", None, &cancel).await.err(),
            Some(AggregatorError::InvalidTicker)
        );
    }
}
