use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::error::EngineError;
use super::fanout::{accounts_for, fan_out, within, CancelSignal, TaskOutcome};
use crate::brokerage::{
    normalize_ticker, position_of, AccountId, AccountOrderResult, BrokerageClient, BrokerageError,
    BrokerageId, ClientHandle, ClientRegistry, OrderAck, OrderRequest, OrderResult, OrderSide, OrderStatus,
};
use crate::core::config::ExecutionConfig;
use crate::limits::{RateLimiter, RateLimiterSet};
use crate::market::{MarketCalendar, PriceFeed};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub indeterminate: usize,
    /// Orders that went through, counted per account.
    pub orders_placed: usize,
}

impl ExecutionSummary {
    pub fn from_results(results: &[OrderResult]) -> Self {
        results.iter().fold(Self::default(), |mut summary, result| {
            match result.status {
                OrderStatus::Succeeded => summary.succeeded += 1,
                OrderStatus::Failed => summary.failed += 1,
                OrderStatus::Skipped => summary.skipped += 1,
                OrderStatus::Indeterminate => summary.indeterminate += 1,
            }
            summary.orders_placed += result.placed();
            summary
        })
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.indeterminate
    }
}

/// Outcome of one ticker/side across every targeted brokerage.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub ticker: String,
    pub side: OrderSide,
    pub results: Vec<OrderResult>,
    pub summary: ExecutionSummary,
}

impl ExecutionReport {
    fn new(ticker: String, side: OrderSide, results: Vec<OrderResult>) -> Self {
        let summary = ExecutionSummary::from_results(&results);
        Self {
            ticker,
            side,
            results,
            summary,
        }
    }

    fn all(ticker: String, side: OrderSide, targets: &[BrokerageId], status: OrderStatus, detail: &str) -> Self {
        let results = targets
            .iter()
            .map(|id| OrderResult::new(*id, status, detail))
            .collect();
        Self::new(ticker, side, results)
    }

    pub fn result_for(&self, identity: BrokerageId) -> Option<&OrderResult> {
        self.results.iter().find(|r| r.identity == identity)
    }
}

/// What every per-client task needs, shared read-only across the fan-out.
struct DispatchPlan {
    ticker: String,
    side: OrderSide,
    check_tradable: bool,
    /// Price plus buffer. The client's own fee is added per task.
    cash_floor: Option<Decimal>,
    /// Bound on each single backend call.
    call_timeout: Duration,
}

#[derive(Debug, Clone)]
enum Stage {
    /// Guards running; nothing sent yet.
    Checking,
    /// `place_order` issued and not yet answered.
    Sent,
    Done(AccountOrderResult),
}

/// How far each account of one brokerage got. Outlives the task, so a
/// brokerage that times out or is cancelled as a whole can still be
/// reported account by account.
#[derive(Default)]
struct DispatchLedger {
    stages: Mutex<Vec<(AccountId, Stage)>>,
}

impl DispatchLedger {
    async fn begin(&self, accounts: &[AccountId]) {
        *self.stages.lock().await = accounts
            .iter()
            .map(|a| (a.clone(), Stage::Checking))
            .collect();
    }

    async fn set(&self, account: &AccountId, stage: Stage) {
        let mut stages = self.stages.lock().await;
        if let Some(entry) = stages.iter_mut().find(|(id, _)| id == account) {
            entry.1 = stage;
        }
    }

    async fn settle(&self, identity: BrokerageId, cut: &Interruption) -> OrderResult {
        let stages = self.stages.lock().await;
        if stages.is_empty() {
            let (status, detail) = cut.unsent();
            return OrderResult::new(identity, status, detail);
        }
        let accounts = stages
            .iter()
            .map(|(account, stage)| match stage {
                Stage::Done(result) => result.clone(),
                Stage::Sent => AccountOrderResult::new(account.clone(), OrderStatus::Indeterminate, cut.in_flight()),
                Stage::Checking => {
                    let (status, detail) = cut.unsent();
                    AccountOrderResult::new(account.clone(), status, detail)
                }
            })
            .collect();
        OrderResult::from_accounts(identity, accounts)
    }
}

/// Why a brokerage's task ended without returning.
enum Interruption {
    TimedOut(Duration),
    Cancelled,
    Panicked(String),
}

impl Interruption {
    /// Outcome for an account whose order was never sent.
    fn unsent(&self) -> (OrderStatus, String) {
        match self {
            Interruption::TimedOut(limit) => (
                OrderStatus::Failed,
                format!("no response within {}s, order not sent", limit.as_secs()),
            ),
            Interruption::Cancelled => (OrderStatus::Skipped, "cancelled before dispatch".to_string()),
            Interruption::Panicked(reason) => (OrderStatus::Failed, format!("task panicked: {}", reason)),
        }
    }

    /// Detail for an account whose order was sent but never answered.
    fn in_flight(&self) -> String {
        match self {
            Interruption::TimedOut(limit) => {
                format!("no response within {}s, order state unknown", limit.as_secs())
            }
            Interruption::Cancelled => "cancelled while in flight, order state unknown".to_string(),
            Interruption::Panicked(reason) => format!("task panicked after dispatch ({}), order state unknown", reason),
        }
    }
}

/// Places one single-share market order in every account of each targeted
/// brokerage.
///
/// Brokerages run concurrently. Within one brokerage the accounts run
/// concurrently too, bounded by that brokerage's rate limiter, and each
/// order holds the limiter for its trade delay. Guards run per account
/// immediately before its dispatch: the holdings rule (buy only from flat,
/// sell only when holding) and, when a price feed is attached, buying
/// power. Tradability is checked once per brokerage. Holdings can change
/// between the check and the order; the guard is best-effort, not
/// transactional.
pub struct OrderExecutionEngine {
    registry: Arc<ClientRegistry>,
    limiters: Arc<RateLimiterSet>,
    calendar: Arc<dyn MarketCalendar>,
    price_feed: Option<Arc<dyn PriceFeed>>,
    config: ExecutionConfig,
}

impl OrderExecutionEngine {
    pub fn new(
        registry: Arc<ClientRegistry>,
        limiters: Arc<RateLimiterSet>,
        calendar: Arc<dyn MarketCalendar>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            limiters,
            calendar,
            price_feed: None,
            config,
        }
    }

    pub fn with_price_feed(mut self, feed: Arc<dyn PriceFeed>) -> Self {
        self.price_feed = Some(feed);
        self
    }

    pub async fn execute(
        &self,
        ticker: &str,
        side: OrderSide,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
    ) -> Result<ExecutionReport, EngineError> {
        let ticker = normalize_ticker(ticker).ok_or(EngineError::InvalidTicker)?;
        let selected = self.registry.select(targets)?;
        if selected.is_empty() {
            return Err(EngineError::NoUsableClients);
        }
        let identities: Vec<BrokerageId> = selected.iter().map(|(id, _)| *id).collect();

        tracing::info!(
            "🎯 {} {} on {} brokerages",
            side.to_string().to_uppercase(),
            ticker,
            identities.len()
        );

        if !self.calendar.is_open(Utc::now()) {
            tracing::warn!("🔒 Market is closed, skipping {} {}", side, ticker);
            return Ok(ExecutionReport::all(ticker, side, &identities, OrderStatus::Skipped, "market closed"));
        }
        if cancel.is_cancelled() {
            return Ok(ExecutionReport::all(
                ticker,
                side,
                &identities,
                OrderStatus::Skipped,
                "cancelled before dispatch",
            ));
        }

        let plan = Arc::new(DispatchPlan {
            cash_floor: self.cash_floor(&ticker, side).await,
            ticker: ticker.clone(),
            side,
            check_tradable: self.config.check_tradable,
            call_timeout: self.config.order_timeout(),
        });
        let limiters = self.limiters.clone();
        let client_timeout = self.config.client_timeout();

        let mut ledgers = Vec::with_capacity(selected.len());
        let targets: Vec<_> = selected
            .into_iter()
            .map(|(identity, handle)| {
                let ledger = Arc::new(DispatchLedger::default());
                ledgers.push(ledger.clone());
                (identity, (handle, ledger))
            })
            .collect();

        let outcomes = fan_out(targets, client_timeout, cancel, move |identity, (handle, ledger)| {
            let limiter = limiters.get(identity);
            let plan = plan.clone();
            async move { dispatch(identity, handle, limiter, plan, ledger).await }
        })
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for ((identity, outcome), ledger) in outcomes.into_iter().zip(ledgers) {
            let cut = match outcome {
                TaskOutcome::Completed(result) => {
                    results.push(result);
                    continue;
                }
                TaskOutcome::TimedOut => Interruption::TimedOut(client_timeout),
                TaskOutcome::Cancelled => Interruption::Cancelled,
                TaskOutcome::Panicked(reason) => Interruption::Panicked(reason),
            };
            let result = ledger.settle(identity, &cut).await;
            tracing::warn!("⏳ {} {} {}: {:?} ({})", identity, side, ticker, result.status, result.detail);
            results.push(result);
        }

        let report = ExecutionReport::new(ticker, side, results);
        tracing::info!(
            "📊 {} {}: {} succeeded, {} failed, {} skipped, {} indeterminate ({} orders placed)",
            report.side,
            report.ticker,
            report.summary.succeeded,
            report.summary.failed,
            report.summary.skipped,
            report.summary.indeterminate,
            report.summary.orders_placed
        );
        Ok(report)
    }

    /// Runs [`execute`](Self::execute) for each ticker in turn. Every ticker
    /// is validated before the first one is dispatched.
    pub async fn execute_batch<I, S>(
        &self,
        tickers: I,
        side: OrderSide,
        targets: Option<&[BrokerageId]>,
        cancel: &CancelSignal,
    ) -> Result<Vec<ExecutionReport>, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tickers = tickers
            .into_iter()
            .map(|t| normalize_ticker(t.as_ref()).ok_or(EngineError::InvalidTicker))
            .collect::<Result<Vec<_>, _>>()?;
        if tickers.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        self.registry.select(targets)?;

        let mut reports = Vec::with_capacity(tickers.len());
        for ticker in &tickers {
            reports.push(self.execute(ticker, side, targets, cancel).await?);
        }
        Ok(reports)
    }

    async fn cash_floor(&self, ticker: &str, side: OrderSide) -> Option<Decimal> {
        if side != OrderSide::Buy || !self.config.check_buying_power {
            return None;
        }
        let feed = self.price_feed.as_ref()?;
        match feed.get_price(ticker).await {
            Ok(price) => Some(price + self.config.buying_power_buffer),
            Err(e) => {
                tracing::warn!("⚠️ {}; skipping buying-power check", e);
                None
            }
        }
    }
}

async fn dispatch(
    identity: BrokerageId,
    handle: ClientHandle,
    limiter: Arc<RateLimiter>,
    plan: Arc<DispatchPlan>,
    ledger: Arc<DispatchLedger>,
) -> OrderResult {
    let client = handle.client();
    let client = client.as_ref();
    let ticker = plan.ticker.as_str();

    if plan.check_tradable {
        match limiter.run(|| within(plan.call_timeout, client.is_tradable(ticker))).await {
            Ok(true) => {}
            Ok(false) => {
                return OrderResult::new(
                    identity,
                    OrderStatus::Skipped,
                    format!("{} is not tradable on {}", ticker, identity),
                )
            }
            Err(e) if e.is_unsupported() => {}
            Err(e) => {
                return OrderResult::new(identity, OrderStatus::Failed, format!("tradability check failed: {}", e))
            }
        }
    }

    let accounts = match accounts_for(&handle, &limiter, plan.call_timeout).await {
        Ok(accounts) => accounts,
        Err(e) => {
            return OrderResult::new(identity, OrderStatus::Failed, format!("account lookup failed: {}", e))
        }
    };
    ledger.begin(&accounts).await;

    let per_account = accounts
        .iter()
        .map(|account| dispatch_account(identity, client, &limiter, &plan, &ledger, account));
    let results = join_all(per_account).await;

    let result = OrderResult::from_accounts(identity, results);
    if result.accounts.len() > 1 {
        tracing::info!(
            "{}/{} {} orders placed on {} for {}",
            result.placed(),
            result.accounts.len(),
            plan.side,
            identity,
            ticker
        );
    }
    result
}

async fn dispatch_account(
    identity: BrokerageId,
    client: &dyn BrokerageClient,
    limiter: &RateLimiter,
    plan: &DispatchPlan,
    ledger: &DispatchLedger,
    account: &AccountId,
) -> AccountOrderResult {
    let result = guard_and_place(identity, client, limiter, plan, ledger, account).await;
    ledger.set(account, Stage::Done(result.clone())).await;
    result
}

async fn guard_and_place(
    identity: BrokerageId,
    client: &dyn BrokerageClient,
    limiter: &RateLimiter,
    plan: &DispatchPlan,
    ledger: &DispatchLedger,
    account: &AccountId,
) -> AccountOrderResult {
    let ticker = plan.ticker.as_str();
    let limit = plan.call_timeout;
    let skipped = |detail: String| AccountOrderResult::new(account.clone(), OrderStatus::Skipped, detail);
    let failed = |detail: String| AccountOrderResult::new(account.clone(), OrderStatus::Failed, detail);

    let held = match limiter.run(|| within(limit, client.get_holdings(account))).await {
        Ok(holdings) => position_of(&holdings, ticker),
        Err(e) if e.is_unsupported() => return skipped(format!("holdings unavailable: {}", e)),
        Err(e) => return failed(format!("holdings check failed: {}", e)),
    };
    match plan.side {
        OrderSide::Buy if held > Decimal::ZERO => {
            return skipped(format!("already holds {} {}", held, ticker));
        }
        OrderSide::Sell if held <= Decimal::ZERO => {
            return skipped(format!("no {} position to sell", ticker));
        }
        _ => {}
    }

    if let Some(floor) = plan.cash_floor {
        let required = floor + client.transaction_fee();
        match limiter.run(|| within(limit, client.get_balance(account))).await {
            Ok(cash) if cash < required => {
                return skipped(format!("insufficient funds: {} available, {} required", cash, required));
            }
            Ok(_) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) => return failed(format!("balance check failed: {}", e)),
        }
    }

    let order = OrderRequest::market(account.clone(), ticker, plan.side);
    let order = &order;
    let answer = limiter
        .run_paced(|| async move {
            ledger.set(account, Stage::Sent).await;
            let answer = within(limit, client.place_order(order)).await;
            // Recorded before the trade delay starts. A backoff retry marks it Sent again.
            ledger.set(account, Stage::Done(order_outcome(order, &answer))).await;
            answer
        })
        .await;

    let result = order_outcome(order, &answer);
    match result.status {
        OrderStatus::Succeeded => {
            tracing::info!("✅ {} [{}] {} {} placed: {}", identity, account, plan.side, ticker, result.detail)
        }
        OrderStatus::Indeterminate => {
            tracing::warn!("⏳ {} [{}] {} {}: {}", identity, account, plan.side, ticker, result.detail)
        }
        OrderStatus::Failed => {
            tracing::error!("❌ {} [{}] {} {} failed: {}", identity, account, plan.side, ticker, result.detail)
        }
        OrderStatus::Skipped => {}
    }
    result
}

fn order_outcome(order: &OrderRequest, answer: &Result<OrderAck, BrokerageError>) -> AccountOrderResult {
    let account = order.account.clone();
    match answer {
        Ok(ack) => AccountOrderResult::new(account, OrderStatus::Succeeded, ack.order_id.clone()),
        Err(e) if e.is_unsupported() => AccountOrderResult::new(account, OrderStatus::Skipped, e.to_string()),
        Err(BrokerageError::Timeout(ms)) => AccountOrderResult::new(
            account,
            OrderStatus::Indeterminate,
            format!("no response within {}s, order state unknown", ms / 1000),
        ),
        Err(e) => AccountOrderResult::new(account, OrderStatus::Failed, e.to_string()),
    }
}
