use thiserror::Error;

use crate::brokerage::BrokerageId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication has already been run by this coordinator")]
    AlreadyStarted,

    #[error("No brokerages configured")]
    NoClientsConfigured,

    #[error("No brokerage authenticated successfully")]
    NoUsableClients,

    #[error("Aborted after failed logins: {failed:?}")]
    Aborted { failed: Vec<BrokerageId> },
}
