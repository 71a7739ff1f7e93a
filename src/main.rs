use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;

use multi_brokerage_trading_bot::auth::{AuthCoordinator, FixedDecision};
use multi_brokerage_trading_bot::brokerage::{BrokerageId, OrderSide, PaperBrokerageClient, RegistryBuilder};
use multi_brokerage_trading_bot::core::{logging, Config};
use multi_brokerage_trading_bot::market::{
    FixedCalendar, InMemorySessionStore, MarketCalendar, NyseCalendar, StaticCredentialProvider,
    StaticPriceFeed,
};
use multi_brokerage_trading_bot::portfolio::{PortfolioAggregator, ProfitProjectionCalculator};
use multi_brokerage_trading_bot::trading::{CancelSignal, OrderExecutionEngine};

const USAGE: &str = "usage: multi-brokerage-trading-bot <balances | holdings | buy TICKER | sell TICKER | project TICKER RATIO>";

enum Command {
    Balances,
    Holdings,
    Order(OrderSide, String),
    Project(String, Decimal),
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args {
        [cmd] if cmd == "balances" => Ok(Command::Balances),
        [cmd] if cmd == "holdings" => Ok(Command::Holdings),
        [side, ticker] if side == "buy" || side == "sell" => {
            let side: OrderSide = side.parse().map_err(anyhow::Error::msg)?;
            Ok(Command::Order(side, ticker.clone()))
        }
        [cmd, ticker, ratio] if cmd == "project" => {
            let ratio: Decimal = ratio
                .parse()
                .with_context(|| format!("invalid split ratio: {}", ratio))?;
            Ok(Command::Project(ticker.clone(), ratio))
        }
        _ => bail!(USAGE),
    }
}

/// Paper brokerages seeded from config, each with `paper.accounts`
/// accounts. Tradier charges its per-order fee.
fn paper_registry(config: &Config) -> Result<RegistryBuilder> {
    let mut builder = RegistryBuilder::new();
    for identity in &config.brokerages.enabled {
        let mut client = PaperBrokerageClient::new(*identity)
            .with_cash(config.paper.starting_cash)
            .with_accounts(config.paper.accounts);
        for (ticker, price) in &config.paper.prices {
            client = client.with_price(ticker, *price);
        }
        if *identity == BrokerageId::Tradier {
            client = client.with_fee(Decimal::new(35, 2));
        }
        builder.add(Arc::new(client))?;
    }
    Ok(builder)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    let config = Config::load()?;
    logging::init_logging(&config.monitoring.log_level);

    tracing::info!("🚀 Multi-brokerage trading bot starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Enabled brokerages: {:?}", config.brokerages.enabled);

    let (cancel_handle, cancel) = CancelSignal::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, cancelling in-flight work");
            cancel_handle.cancel();
        }
    });

    let limiters = Arc::new(config.rate_limits.build());
    let price_feed = Arc::new(StaticPriceFeed::with_prices(
        config.paper.prices.iter().map(|(t, p)| (t.as_str(), *p)),
    ));

    let mut coordinator = AuthCoordinator::new(
        Arc::new(StaticCredentialProvider::new()),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(FixedDecision(config.auth.proceed_on_partial)),
        limiters.clone(),
        config.auth.clone(),
    );
    let outcome = coordinator
        .authenticate_all(paper_registry(&config)?, &cancel)
        .await?;
    let registry = outcome.into_registry()?;

    match command {
        Command::Balances => {
            let aggregator = PortfolioAggregator::new(registry, limiters, config.portfolio.clone());
            let report = aggregator.get_balances(None, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Holdings => {
            let aggregator = PortfolioAggregator::new(registry, limiters, config.portfolio.clone());
            let report = aggregator.get_holdings(None, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Order(side, ticker) => {
            let calendar: Arc<dyn MarketCalendar> = if config.market.enforce_hours {
                Arc::new(NyseCalendar::new(config.market.holidays.clone()))
            } else {
                Arc::new(FixedCalendar(true))
            };
            let engine = OrderExecutionEngine::new(registry, limiters, calendar, config.execution.clone())
                .with_price_feed(price_feed);
            let report = engine.execute(&ticker, side, None, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Project(ticker, ratio) => {
            let aggregator = Arc::new(PortfolioAggregator::new(registry, limiters, config.portfolio.clone()));
            let calculator = ProfitProjectionCalculator::new(aggregator, price_feed);
            let report = calculator.project(&ticker, ratio, None, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
