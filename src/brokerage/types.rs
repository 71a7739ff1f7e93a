use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The eight supported brokerage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerageId {
    Robinhood,
    Schwab,
    Public,
    Firstrade,
    Fennel,
    Tradier,
    Dspac,
    Bbae,
}

impl BrokerageId {
    pub const ALL: [BrokerageId; 8] = [
        BrokerageId::Robinhood,
        BrokerageId::Schwab,
        BrokerageId::Public,
        BrokerageId::Firstrade,
        BrokerageId::Fennel,
        BrokerageId::Tradier,
        BrokerageId::Dspac,
        BrokerageId::Bbae,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerageId::Robinhood => "robinhood",
            BrokerageId::Schwab => "schwab",
            BrokerageId::Public => "public",
            BrokerageId::Firstrade => "firstrade",
            BrokerageId::Fennel => "fennel",
            BrokerageId::Tradier => "tradier",
            BrokerageId::Dspac => "dspac",
            BrokerageId::Bbae => "bbae",
        }
    }

    /// Stable index in `0..8`, used for array-backed per-brokerage tables.
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Backends that demand an emailed/SMS code on every login. Their
    /// sessions are never persisted or resumed.
    pub fn requires_step_up(&self) -> bool {
        matches!(self, BrokerageId::Firstrade | BrokerageId::Fennel)
    }
}

impl fmt::Display for BrokerageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BrokerageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        BrokerageId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "Unknown brokerage: {}. Valid options: robinhood, schwab, public, firstrade, fennel, tradier, dspac, bbae",
                    s
                )
            })
    }
}

/// Opaque session artifact. The core stores and forwards it but never looks inside.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Vec<u8>);

impl SessionToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken(<{} bytes>)", self.0.len())
    }
}

/// Secret bundle for one backend. Shape varies per backend; the core does not interpret it.
#[derive(Clone, Default)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

/// Account number at one brokerage. A login can expose several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => f.write_str("buy"),
            OrderSide::Sell => f.write_str("sell"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(format!("Invalid side: {}. Enter 'buy' or 'sell'", other)),
        }
    }
}

/// Single-share market order against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account: AccountId,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: u32,
}

impl OrderRequest {
    pub fn market(account: AccountId, ticker: impl Into<String>, side: OrderSide) -> Self {
        Self {
            account,
            ticker: ticker.into(),
            side,
            quantity: 1,
        }
    }
}

/// Backend acknowledgement for a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Timed out or cancelled after dispatch; the real outcome is unknown.
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOrderResult {
    pub account: AccountId,
    pub status: OrderStatus,
    pub detail: String,
}

impl AccountOrderResult {
    pub fn new(account: AccountId, status: OrderStatus, detail: impl Into<String>) -> Self {
        Self {
            account,
            status,
            detail: detail.into(),
        }
    }
}

/// One brokerage's outcome for an order, rolled up over its accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult {
    pub identity: BrokerageId,
    pub status: OrderStatus,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountOrderResult>,
}

impl OrderResult {
    pub fn new(identity: BrokerageId, status: OrderStatus, detail: impl Into<String>) -> Self {
        Self {
            identity,
            status,
            detail: detail.into(),
            accounts: Vec::new(),
        }
    }

    /// Rolls per-account outcomes up to one status for the brokerage:
    /// Indeterminate if any account is, else Failed if any account failed,
    /// else Succeeded if any order went through, else Skipped.
    pub fn from_accounts(identity: BrokerageId, accounts: Vec<AccountOrderResult>) -> Self {
        if accounts.is_empty() {
            return Self::new(identity, OrderStatus::Skipped, "no accounts found");
        }

        let count = |status: OrderStatus| accounts.iter().filter(|a| a.status == status).count();
        let placed = count(OrderStatus::Succeeded);
        let status = if count(OrderStatus::Indeterminate) > 0 {
            OrderStatus::Indeterminate
        } else if count(OrderStatus::Failed) > 0 {
            OrderStatus::Failed
        } else if placed > 0 {
            OrderStatus::Succeeded
        } else {
            OrderStatus::Skipped
        };

        let detail = match accounts.as_slice() {
            [only] => only.detail.clone(),
            _ => format!("{}/{} accounts placed", placed, accounts.len()),
        };

        Self {
            identity,
            status,
            detail,
            accounts,
        }
    }

    /// Orders that went through, across accounts.
    pub fn placed(&self) -> usize {
        if self.accounts.is_empty() {
            return usize::from(self.status == OrderStatus::Succeeded);
        }
        self.accounts
            .iter()
            .filter(|a| a.status == OrderStatus::Succeeded)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub identity: BrokerageId,
    pub success: bool,
    pub failure_reason: Option<String>,
}

impl AuthResult {
    pub fn succeeded(identity: BrokerageId) -> Self {
        Self {
            identity,
            success: true,
            failure_reason: None,
        }
    }

    pub fn failed(identity: BrokerageId, reason: impl Into<String>) -> Self {
        Self {
            identity,
            success: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Ticker → share quantity for one account.
pub type Holdings = BTreeMap<String, Decimal>;

/// Adds `other` into `into`, ticker by ticker.
pub fn merge_holdings(into: &mut Holdings, other: &Holdings) {
    for (ticker, quantity) in other {
        *into.entry(ticker.clone()).or_insert(Decimal::ZERO) += *quantity;
    }
}

/// Trimmed, upper-cased ticker, or `None` when nothing is left.
pub fn normalize_ticker(ticker: &str) -> Option<String> {
    let ticker = ticker.trim().to_uppercase();
    (!ticker.is_empty()).then_some(ticker)
}

/// Quantity held for `ticker`, matching case-insensitively. Absent means zero.
pub fn position_of(holdings: &Holdings, ticker: &str) -> Decimal {
    holdings
        .iter()
        .find(|(held, _)| held.eq_ignore_ascii_case(ticker))
        .map(|(_, quantity)| *quantity)
        .unwrap_or(Decimal::ZERO)
}
