use thiserror::Error;

use crate::brokerage::{BrokerageId, RegistryError};

/// Conditions that stop an order call before anything is dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Ticker must not be empty")]
    InvalidTicker,

    #[error("Brokerage {0} is not available in this session")]
    UnknownClient(BrokerageId),

    #[error("No usable brokerage clients for this request")]
    NoUsableClients,

    #[error("Batch contains no tickers")]
    EmptyBatch,
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Unknown(id) | RegistryError::Duplicate(id) => EngineError::UnknownClient(id),
        }
    }
}
