pub mod client;
pub mod error;
pub mod paper;
pub mod registry;
pub mod types;

pub use client::BrokerageClient;
pub use error::BrokerageError;
pub use paper::{PaperBrokerageClient, PaperCallStats};
pub use registry::{AuthState, ClientHandle, ClientRegistry, RegistryBuilder, RegistryError};
pub use types::*;
