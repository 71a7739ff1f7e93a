pub mod coordinator;
pub mod decision;
pub mod error;

pub use coordinator::{AuthCoordinator, AuthOutcome, CoordinatorState};
pub use decision::{ChannelDecision, DecisionHandler, DecisionRequest, FixedDecision, FnDecision};
pub use error::AuthError;
