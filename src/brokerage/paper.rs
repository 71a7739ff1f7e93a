use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::client::BrokerageClient;
use super::error::BrokerageError;
use super::types::{
    AccountId, BrokerageId, Credentials, Holdings, OrderAck, OrderRequest, OrderSide, SessionToken,
};

#[derive(Debug, Default, Clone)]
struct PaperAccount {
    cash: Decimal,
    holdings: Holdings,
}

#[derive(Debug, Default)]
struct PaperState {
    authenticated: bool,
    accounts: BTreeMap<AccountId, PaperAccount>,
}

/// Call counters, shared so tests can keep a handle after the client moves
/// into a registry.
#[derive(Debug, Default)]
pub struct PaperCallStats {
    pub auth_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub account_calls: AtomicUsize,
    pub balance_calls: AtomicUsize,
    pub holdings_calls: AtomicUsize,
    pub order_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl PaperCallStats {
    pub fn orders(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn account_lookups(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst)
    }

    pub fn holdings(&self) -> usize {
        self.holdings_calls.load(Ordering::SeqCst)
    }

    pub fn balances(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a PaperCallStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory brokerage used for paper trading and tests.
///
/// Behaviour is scripted up front with the `with_*` builders: accounts,
/// starting cash, positions, artificial latency, queued failures per
/// operation. A fresh client has a single account, `<identity>-1`.
pub struct PaperBrokerageClient {
    identity: BrokerageId,
    state: RwLock<PaperState>,
    prices: BTreeMap<String, Decimal>,
    untradable: HashSet<String>,
    fee: Decimal,
    latency: Duration,
    order_latency: Option<Duration>,
    issue_sessions: bool,
    accepted_password: Option<String>,
    auth_failures: Mutex<VecDeque<BrokerageError>>,
    account_failures: Mutex<VecDeque<BrokerageError>>,
    balance_failures: Mutex<VecDeque<BrokerageError>>,
    holdings_failures: Mutex<VecDeque<BrokerageError>>,
    order_failures: Mutex<VecDeque<BrokerageError>>,
    issued_session: RwLock<Option<SessionToken>>,
    stats: Arc<PaperCallStats>,
}

impl PaperBrokerageClient {
    pub fn new(identity: BrokerageId) -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert(Self::account_for(identity, 1), PaperAccount::default());
        Self {
            identity,
            state: RwLock::new(PaperState {
                authenticated: false,
                accounts,
            }),
            prices: BTreeMap::new(),
            untradable: HashSet::new(),
            fee: Decimal::ZERO,
            latency: Duration::ZERO,
            order_latency: None,
            issue_sessions: !identity.requires_step_up(),
            accepted_password: None,
            auth_failures: Mutex::new(VecDeque::new()),
            account_failures: Mutex::new(VecDeque::new()),
            balance_failures: Mutex::new(VecDeque::new()),
            holdings_failures: Mutex::new(VecDeque::new()),
            order_failures: Mutex::new(VecDeque::new()),
            issued_session: RwLock::new(None),
            stats: Arc::new(PaperCallStats::default()),
        }
    }

    fn account_for(identity: BrokerageId, n: usize) -> AccountId {
        AccountId::new(format!("{}-{}", identity, n))
    }

    /// Id of the `n`th paper account, counting from 1.
    pub fn account(&self, n: usize) -> AccountId {
        Self::account_for(self.identity, n)
    }

    /// Replaces the account set with `count` accounts, each a copy of the
    /// first account as configured so far. Zero leaves a login with no accounts.
    pub fn with_accounts(mut self, count: usize) -> Self {
        let state = self.state.get_mut();
        let template = state.accounts.values().next().cloned().unwrap_or_default();
        state.accounts = (1..=count)
            .map(|n| (Self::account_for(self.identity, n), template.clone()))
            .collect();
        self
    }

    /// Sets the cash of every account.
    pub fn with_cash(mut self, cash: Decimal) -> Self {
        for account in self.state.get_mut().accounts.values_mut() {
            account.cash = cash;
        }
        self
    }

    /// Puts the position in every account.
    pub fn with_position(mut self, ticker: &str, quantity: Decimal) -> Self {
        for account in self.state.get_mut().accounts.values_mut() {
            account.holdings.insert(ticker.to_uppercase(), quantity);
        }
        self
    }

    /// Puts the position in the `n`th account only.
    pub fn with_position_in(mut self, n: usize, ticker: &str, quantity: Decimal) -> Self {
        let id = self.account(n);
        self.state
            .get_mut()
            .accounts
            .entry(id)
            .or_default()
            .holdings
            .insert(ticker.to_uppercase(), quantity);
        self
    }

    pub fn with_price(mut self, ticker: &str, price: Decimal) -> Self {
        self.prices.insert(ticker.to_uppercase(), price);
        self
    }

    pub fn with_untradable(mut self, ticker: &str) -> Self {
        self.untradable.insert(ticker.to_uppercase());
        self
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    /// Delay applied to every backend call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay applied to order placement only.
    pub fn with_order_latency(mut self, latency: Duration) -> Self {
        self.order_latency = Some(latency);
        self
    }

    /// Only this password is accepted; anything else is a credential failure.
    pub fn with_password(mut self, password: &str) -> Self {
        self.accepted_password = Some(password.to_string());
        self
    }

    pub fn with_sessions(mut self, issue: bool) -> Self {
        self.issue_sessions = issue;
        self
    }

    pub fn fail_auth(mut self, error: BrokerageError) -> Self {
        self.auth_failures.get_mut().push_back(error);
        self
    }

    pub fn fail_accounts(mut self, error: BrokerageError) -> Self {
        self.account_failures.get_mut().push_back(error);
        self
    }

    pub fn fail_balance(mut self, error: BrokerageError) -> Self {
        self.balance_failures.get_mut().push_back(error);
        self
    }

    pub fn fail_holdings(mut self, error: BrokerageError) -> Self {
        self.holdings_failures.get_mut().push_back(error);
        self
    }

    pub fn fail_order(mut self, error: BrokerageError) -> Self {
        self.order_failures.get_mut().push_back(error);
        self
    }

    pub fn stats(&self) -> Arc<PaperCallStats> {
        self.stats.clone()
    }

    /// Cash summed over every account.
    pub async fn cash(&self) -> Decimal {
        self.state.read().await.accounts.values().map(|a| a.cash).sum()
    }

    /// Shares of `ticker` summed over every account.
    pub async fn position(&self, ticker: &str) -> Decimal {
        let ticker = ticker.to_uppercase();
        self.state
            .read()
            .await
            .accounts
            .values()
            .filter_map(|a| a.holdings.get(&ticker).copied())
            .sum()
    }

    pub async fn position_in(&self, n: usize, ticker: &str) -> Decimal {
        self.state
            .read()
            .await
            .accounts
            .get(&self.account(n))
            .and_then(|a| a.holdings.get(&ticker.to_uppercase()).copied())
            .unwrap_or(Decimal::ZERO)
    }

    async fn simulate_latency(&self, extra: Option<Duration>) {
        let delay = extra.unwrap_or(self.latency);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn ensure_authenticated(&self) -> Result<(), BrokerageError> {
        if self.state.read().await.authenticated {
            Ok(())
        } else {
            Err(BrokerageError::AuthExpired(format!(
                "{} session is not authenticated",
                self.identity
            )))
        }
    }

    async fn read_account<T>(
        &self,
        account: &AccountId,
        read: impl FnOnce(&PaperAccount) -> T,
    ) -> Result<T, BrokerageError> {
        self.ensure_authenticated().await?;
        let state = self.state.read().await;
        state
            .accounts
            .get(account)
            .map(read)
            .ok_or_else(|| self.unknown_account(account))
    }

    fn unknown_account(&self, account: &AccountId) -> BrokerageError {
        BrokerageError::Rejected(format!("{} has no account {}", self.identity, account))
    }

    async fn next_failure(queue: &Mutex<VecDeque<BrokerageError>>) -> Option<BrokerageError> {
        queue.lock().await.pop_front()
    }
}

#[async_trait]
impl BrokerageClient for PaperBrokerageClient {
    fn identity(&self) -> BrokerageId {
        self.identity
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<SessionToken>, BrokerageError> {
        self.stats.auth_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.stats.enter();
        self.simulate_latency(None).await;

        if let Some(err) = Self::next_failure(&self.auth_failures).await {
            return Err(err);
        }
        if let Some(expected) = &self.accepted_password {
            if credentials.get("password") != Some(expected.as_str()) {
                return Err(BrokerageError::AuthCredential(format!(
                    "{} rejected the supplied password",
                    self.identity
                )));
            }
        }

        self.state.write().await.authenticated = true;

        if !self.issue_sessions {
            return Ok(None);
        }
        let token = SessionToken::new(format!("paper-{}-{}", self.identity, Uuid::new_v4()));
        *self.issued_session.write().await = Some(token.clone());
        Ok(Some(token))
    }

    async fn resume_session(&self, token: &SessionToken) -> Result<(), BrokerageError> {
        self.stats.resume_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.stats.enter();
        self.simulate_latency(None).await;

        if !self.issue_sessions {
            return Err(BrokerageError::Unsupported {
                identity: self.identity,
                operation: "resume_session",
            });
        }

        // Any token this paper account issued, in this process or a previous
        // one, carries its identity prefix.
        let prefix = format!("paper-{}-", self.identity);
        if token.as_bytes().starts_with(prefix.as_bytes()) {
            self.state.write().await.authenticated = true;
            *self.issued_session.write().await = Some(token.clone());
            Ok(())
        } else {
            Err(BrokerageError::AuthExpired("stored session rejected".to_string()))
        }
    }

    async fn accounts(&self) -> Result<Vec<AccountId>, BrokerageError> {
        self.stats.account_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.stats.enter();
        self.simulate_latency(None).await;

        if let Some(err) = Self::next_failure(&self.account_failures).await {
            return Err(err);
        }
        self.ensure_authenticated().await?;
        Ok(self.state.read().await.accounts.keys().cloned().collect())
    }

    async fn get_balance(&self, account: &AccountId) -> Result<Decimal, BrokerageError> {
        self.stats.balance_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.stats.enter();
        self.simulate_latency(None).await;

        if let Some(err) = Self::next_failure(&self.balance_failures).await {
            return Err(err);
        }
        self.read_account(account, |a| a.cash).await
    }

    async fn get_holdings(&self, account: &AccountId) -> Result<Holdings, BrokerageError> {
        self.stats.holdings_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.stats.enter();
        self.simulate_latency(None).await;

        if let Some(err) = Self::next_failure(&self.holdings_failures).await {
            return Err(err);
        }
        self.read_account(account, |a| a.holdings.clone()).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerageError> {
        self.stats.order_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.stats.enter();
        self.simulate_latency(self.order_latency).await;

        if let Some(err) = Self::next_failure(&self.order_failures).await {
            return Err(err);
        }
        self.ensure_authenticated().await?;

        let ticker = order.ticker.to_uppercase();
        let quantity = Decimal::from(order.quantity);
        let price = self.prices.get(&ticker).copied().unwrap_or(Decimal::ZERO);

        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&order.account)
            .ok_or_else(|| self.unknown_account(&order.account))?;
        match order.side {
            OrderSide::Buy => {
                *account.holdings.entry(ticker.clone()).or_insert(Decimal::ZERO) += quantity;
                account.cash -= price * quantity + self.fee;
            }
            OrderSide::Sell => {
                let held = account.holdings.get(&ticker).copied().unwrap_or(Decimal::ZERO);
                if held < quantity {
                    return Err(BrokerageError::Rejected(format!(
                        "{} account {} cannot sell {}: only {} held",
                        self.identity, order.account, ticker, held
                    )));
                }
                let remaining = held - quantity;
                if remaining.is_zero() {
                    account.holdings.remove(&ticker);
                } else {
                    account.holdings.insert(ticker.clone(), remaining);
                }
                account.cash += price * quantity - self.fee;
            }
        }

        let order_id = Uuid::new_v4().to_string();
        tracing::info!(
            "📝 PAPER {} [{}]: {} {} x{} [{}]",
            self.identity,
            order.account,
            order.side.to_string().to_uppercase(),
            ticker,
            order.quantity,
            &order_id[..8]
        );

        Ok(OrderAck { order_id })
    }

    async fn is_tradable(&self, ticker: &str) -> Result<bool, BrokerageError> {
        Ok(!self.untradable.contains(&ticker.to_uppercase()))
    }

    fn transaction_fee(&self) -> Decimal {
        self.fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_paper_buy_then_sell() {
        let client = PaperBrokerageClient::new(BrokerageId::Tradier)
            .with_cash(dec!(100))
            .with_price("ABCD", dec!(2.50))
            .with_fee(dec!(0.35));
        client.authenticate(&Credentials::new()).await.unwrap();
        let account = client.account(1);

        client
            .place_order(&OrderRequest::market(account.clone(), "abcd", OrderSide::Buy))
            .await
            .unwrap();
        assert_eq!(client.position("ABCD").await, dec!(1));
        assert_eq!(client.cash().await, dec!(97.15));

        client
            .place_order(&OrderRequest::market(account.clone(), "ABCD", OrderSide::Sell))
            .await
            .unwrap();
        assert_eq!(client.position("ABCD").await, Decimal::ZERO);
        assert!(!client.get_holdings(&account).await.unwrap().contains_key("ABCD"));
        assert_eq!(client.stats().orders(), 2);
    }

    #[tokio::test]
    async fn test_oversold_sell_is_rejected_not_network() {
        let client = PaperBrokerageClient::new(BrokerageId::Bbae);
        client.authenticate(&Credentials::new()).await.unwrap();

        let err = client
            .place_order(&OrderRequest::market(client.account(1), "ABCD", OrderSide::Sell))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerageError::Rejected(_)));
        assert!(!err.is_retryable_auth());
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let client = PaperBrokerageClient::new(BrokerageId::Fennel)
            .with_cash(dec!(10))
            .with_accounts(3)
            .with_position_in(2, "ABCD", dec!(4));
        client.authenticate(&Credentials::new()).await.unwrap();

        let accounts = client.accounts().await.unwrap();
        assert_eq!(accounts, vec![client.account(1), client.account(2), client.account(3)]);
        assert_eq!(accounts[0].as_str(), "fennel-1");
        assert_eq!(client.cash().await, dec!(30));
        assert_eq!(client.position("ABCD").await, dec!(4));
        assert_eq!(client.position_in(1, "ABCD").await, Decimal::ZERO);

        let unknown = client.get_balance(&AccountId::new("fennel-9")).await.unwrap_err();
        assert!(matches!(unknown, BrokerageError::Rejected(_)));

        let empty = PaperBrokerageClient::new(BrokerageId::Dspac).with_accounts(0);
        empty.authenticate(&Credentials::new()).await.unwrap();
        assert!(empty.accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paper_requires_login() {
        let client = PaperBrokerageClient::new(BrokerageId::Public);
        let err = client.get_balance(&client.account(1)).await.unwrap_err();
        assert!(matches!(err, BrokerageError::AuthExpired(_)));
        assert!(matches!(client.accounts().await, Err(BrokerageError::AuthExpired(_))));
    }

    #[tokio::test]
    async fn test_scripted_auth_failure_is_consumed_once() {
        let client = PaperBrokerageClient::new(BrokerageId::Robinhood)
            .fail_auth(BrokerageError::AuthTransient("captcha".into()));

        assert!(client.authenticate(&Credentials::new()).await.is_err());
        assert!(client.authenticate(&Credentials::new()).await.is_ok());
        assert_eq!(client.stats().auths(), 2);
    }

    #[tokio::test]
    async fn test_session_resume() {
        let first = PaperBrokerageClient::new(BrokerageId::Schwab);
        let token = first
            .authenticate(&Credentials::new())
            .await
            .unwrap()
            .expect("schwab issues sessions");

        let later = PaperBrokerageClient::new(BrokerageId::Schwab);
        later.resume_session(&token).await.unwrap();
        assert!(later.get_balance(&later.account(1)).await.is_ok());

        let step_up = PaperBrokerageClient::new(BrokerageId::Fennel);
        assert!(step_up.authenticate(&Credentials::new()).await.unwrap().is_none());
        assert!(step_up.resume_session(&token).await.unwrap_err().is_unsupported());
    }
}
