//! Collaborators the core consumes but does not own: trading calendar,
//! price source, session persistence and credential lookup.

pub mod calendar;
pub mod credentials;
pub mod price_feed;
pub mod session_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::brokerage::{BrokerageId, Credentials, SessionToken};

pub use calendar::{FixedCalendar, NyseCalendar};
pub use credentials::{EnvCredentialProvider, StaticCredentialProvider};
pub use price_feed::StaticPriceFeed;
pub use session_store::InMemorySessionStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("No price available for {0}")]
    PriceUnavailable(String),

    #[error("Session store failure: {0}")]
    Storage(String),

    #[error("No credentials configured for {0}")]
    MissingCredentials(BrokerageId),
}

pub trait MarketCalendar: Send + Sync {
    fn is_open(&self, at: DateTime<Utc>) -> bool;
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_price(&self, ticker: &str) -> Result<Decimal, CollaboratorError>;
}

/// Persists renewable session artifacts between runs. Tokens are opaque.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, identity: BrokerageId) -> Result<Option<SessionToken>, CollaboratorError>;

    async fn save(&self, identity: BrokerageId, token: &SessionToken) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(&self, identity: BrokerageId) -> Result<Credentials, CollaboratorError>;
}
