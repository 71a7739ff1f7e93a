pub mod error;
pub mod execution;
pub mod fanout;

pub use error::EngineError;
pub use execution::{ExecutionReport, ExecutionSummary, OrderExecutionEngine};
pub use fanout::{fan_out, CancelHandle, CancelSignal, TaskOutcome};
