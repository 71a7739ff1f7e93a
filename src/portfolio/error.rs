use rust_decimal::Decimal;
use thiserror::Error;

use crate::brokerage::{BrokerageId, RegistryError};
use crate::market::CollaboratorError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("Brokerage {0} is not available in this session")]
    UnknownClient(BrokerageId),

    #[error("No usable brokerage clients for this request")]
    NoUsableClients,

    #[error("Ticker must not be empty")]
    InvalidTicker,
}

impl From<RegistryError> for AggregatorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Unknown(id) | RegistryError::Duplicate(id) => AggregatorError::UnknownClient(id),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("Split ratio must be greater than zero, got {0}")]
    InvalidSplitRatio(Decimal),

    #[error("Price unavailable: {0}")]
    Price(#[from] CollaboratorError),

    #[error(transparent)]
    Portfolio(#[from] AggregatorError),
}
