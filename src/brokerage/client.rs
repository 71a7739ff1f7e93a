use async_trait::async_trait;
use rust_decimal::Decimal;

use super::error::BrokerageError;
use super::types::{AccountId, BrokerageId, Credentials, Holdings, OrderAck, OrderRequest, SessionToken};

/// Capability set every brokerage adapter implements.
///
/// Adapters are selected per [`BrokerageId`] when the registry is built. They
/// report raw outcomes; the coordinator and the engines turn those into
/// `AuthResult`/`OrderResult` entries.
#[async_trait]
pub trait BrokerageClient: Send + Sync {
    fn identity(&self) -> BrokerageId;

    /// Interactive (or credential based) login. Returns a renewable session
    /// artifact when the backend issues one.
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<SessionToken>, BrokerageError>;

    /// Non-interactive login from a previously saved session.
    async fn resume_session(&self, _token: &SessionToken) -> Result<(), BrokerageError> {
        Err(BrokerageError::Unsupported {
            identity: self.identity(),
            operation: "resume_session",
        })
    }

    /// Accounts reachable through the current login, in the backend's order.
    async fn accounts(&self) -> Result<Vec<AccountId>, BrokerageError>;

    /// Cash available to trade in one account.
    async fn get_balance(&self, account: &AccountId) -> Result<Decimal, BrokerageError>;

    async fn get_holdings(&self, account: &AccountId) -> Result<Holdings, BrokerageError>;

    /// Places `order` in `order.account`.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerageError>;

    async fn is_tradable(&self, _ticker: &str) -> Result<bool, BrokerageError> {
        Ok(true)
    }

    /// Flat per-order commission.
    fn transaction_fee(&self) -> Decimal {
        Decimal::ZERO
    }
}
