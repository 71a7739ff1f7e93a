use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

use crate::brokerage::BrokerageId;
use crate::limits::{RateLimiterConfig, RateLimiterSet};

const DEFAULT_CONFIG_FILE: &str = "brokerage";
const ENV_PREFIX: &str = "BOT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub brokerages: BrokeragesConfig,
    pub auth: AuthConfig,
    pub execution: ExecutionConfig,
    pub market: MarketConfig,
    pub portfolio: PortfolioConfig,
    pub rate_limits: RateLimitsConfig,
    pub paper: PaperConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokeragesConfig {
    /// Accepts a list or a comma-separated string (`BOT__BROKERAGES__ENABLED=schwab,tradier`).
    #[serde(deserialize_with = "deserialize_identities")]
    pub enabled: Vec<BrokerageId>,
}

impl Default for BrokeragesConfig {
    fn default() -> Self {
        Self {
            enabled: BrokerageId::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub timeout_secs: u64,
    pub verify_account_access: bool,
    pub verify_timeout_secs: u64,
    /// Answer given at the proceed/abort point when nobody is there to ask.
    pub proceed_on_partial: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            verify_account_access: true,
            verify_timeout_secs: 15,
            proceed_on_partial: false,
        }
    }
}

impl AuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Bound on each backend call an order makes: guard reads and the order itself.
    pub order_timeout_secs: u64,
    /// Bound on one brokerage's whole run, across all of its accounts and
    /// the trade delays between them.
    pub client_timeout_secs: u64,
    pub check_tradable: bool,
    pub check_buying_power: bool,
    /// Cash kept on top of price and fee before a buy is attempted.
    pub buying_power_buffer: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: 30,
            client_timeout_secs: 300,
            check_tradable: true,
            check_buying_power: true,
            buying_power_buffer: Decimal::new(20, 2),
        }
    }
}

impl ExecutionConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// When false the calendar is bypassed and the market is treated as open.
    pub enforce_hours: bool,
    pub holidays: Vec<NaiveDate>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            enforce_hours: true,
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    /// Bound on each account read.
    pub read_timeout_secs: u64,
    /// Bound on one brokerage's reads across all of its accounts.
    pub client_timeout_secs: u64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 15,
            client_timeout_secs: 120,
        }
    }
}

impl PortfolioConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub default: RateLimiterConfig,
    pub overrides: HashMap<BrokerageId, RateLimiterConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        // Fennel tolerates two concurrent trades and a short pause between
        // them; everyone else gets one at a time and the full delay.
        let mut overrides = HashMap::new();
        overrides.insert(
            BrokerageId::Fennel,
            RateLimiterConfig {
                max_concurrent: 2,
                trade_delay_min_ms: 1_000,
                trade_delay_max_ms: 1_000,
                ..RateLimiterConfig::default()
            },
        );
        Self {
            default: RateLimiterConfig::default(),
            overrides,
        }
    }
}

impl RateLimitsConfig {
    pub fn build(&self) -> RateLimiterSet {
        RateLimiterSet::new(self.default.clone(), &self.overrides)
    }
}

/// Seed data for the in-memory paper accounts used by the binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub starting_cash: Decimal,
    /// Accounts opened per brokerage, each seeded with `starting_cash`.
    pub accounts: usize,
    pub prices: HashMap<String, Decimal>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_cash: Decimal::new(1000, 0),
            accounts: 1,
            prices: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then `brokerage.toml` if present, then `BOT__*` variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        dotenv::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.brokerages.enabled.is_empty() {
            anyhow::bail!("brokerages.enabled must name at least one brokerage");
        }
        if self.auth.timeout_secs == 0
            || self.execution.order_timeout_secs == 0
            || self.execution.client_timeout_secs == 0
            || self.portfolio.read_timeout_secs == 0
            || self.portfolio.client_timeout_secs == 0
        {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.execution.buying_power_buffer.is_sign_negative() {
            anyhow::bail!("execution.buying_power_buffer cannot be negative");
        }
        let default_limits = std::iter::once(&self.rate_limits.default);
        for limits in default_limits.chain(self.rate_limits.overrides.values()) {
            if limits.trade_delay_min_ms > limits.trade_delay_max_ms {
                anyhow::bail!("rate_limits trade_delay_min_ms cannot exceed trade_delay_max_ms");
            }
        }
        Ok(())
    }
}

fn deserialize_identities<'de, D>(deserializer: D) -> Result<Vec<BrokerageId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    let names = match ListOrCsv::deserialize(deserializer)? {
        ListOrCsv::List(names) => names,
        ListOrCsv::Csv(csv) => csv.split(',').map(str::to_string).collect(),
    };

    let mut identities = Vec::new();
    for name in names.iter().filter(|n| !n.trim().is_empty()) {
        let identity: BrokerageId = name.parse().map_err(serde::de::Error::custom)?;
        if !identities.contains(&identity) {
            identities.push(identity);
        }
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.brokerages.enabled.len(), 8);
        assert_eq!(config.auth.timeout(), Duration::from_secs(30));
        assert_eq!(config.auth.verify_timeout(), Duration::from_secs(15));
        assert!(!config.auth.proceed_on_partial);
        assert_eq!(config.execution.buying_power_buffer, dec!(0.20));
        assert_eq!(config.execution.client_timeout(), Duration::from_secs(300));
        assert_eq!(config.paper.accounts, 1);
        assert_eq!(config.rate_limits.overrides[&BrokerageId::Fennel].max_concurrent, 2);
        assert_eq!(config.monitoring.log_level, "info");
    }

    #[test]
    fn test_enabled_accepts_csv_and_list() {
        let from_csv: BrokeragesConfig =
            serde_json::from_str(r#"{"enabled": "schwab, Tradier,schwab"}"#).unwrap();
        assert_eq!(from_csv.enabled, vec![BrokerageId::Schwab, BrokerageId::Tradier]);

        let from_list: BrokeragesConfig =
            serde_json::from_str(r#"{"enabled": ["fennel", "bbae"]}"#).unwrap();
        assert_eq!(from_list.enabled, vec![BrokerageId::Fennel, BrokerageId::Bbae]);

        assert!(serde_json::from_str::<BrokeragesConfig>(r#"{"enabled": "etrade"}"#).is_err());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "execution": { "order_timeout_secs": 20 },
                "rate_limits": { "overrides": { "schwab": { "max_requests": 5 } } },
                "market": { "holidays": ["2026-12-25"] }
            }"#,
        )
        .unwrap();

        assert_eq!(config.execution.order_timeout(), Duration::from_secs(20));
        assert!(config.execution.check_tradable);
        assert_eq!(config.market.holidays.len(), 1);

        let limits = config.rate_limits.build();
        assert_eq!(limits.get(BrokerageId::Schwab).config().max_requests, 5);
        assert_eq!(limits.get(BrokerageId::Schwab).config().max_concurrent, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_enabled_list() {
        let mut config = Config::default();
        config.brokerages.enabled.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trade_delay_defaults_and_fennel_override() {
        let limits = Config::default().rate_limits.build();

        let schwab = limits.get(BrokerageId::Schwab);
        assert_eq!(schwab.config().trade_delay_min_ms, 4_000);
        assert_eq!(schwab.config().trade_delay_max_ms, 6_000);
        let pause = schwab.trade_delay();
        assert!(pause >= Duration::from_secs(4) && pause <= Duration::from_secs(6));

        assert_eq!(limits.get(BrokerageId::Fennel).trade_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_inverted_trade_delay() {
        let mut config = Config::default();
        config.rate_limits.default.trade_delay_min_ms = 7_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.client_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
