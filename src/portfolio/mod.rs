pub mod aggregator;
pub mod error;
pub mod projection;

pub use aggregator::{
    AccountEntry, BalanceEntry, BalanceReport, FetchStatus, HoldingsEntry, HoldingsReport, PortfolioAggregator,
    PositionEntry, PositionReport,
};
pub use error::{AggregatorError, ProjectionError};
pub use projection::{
    project_split, ProfitProjectionCalculator, ProjectionEntry, ProjectionReport, SplitOutcome,
    CASH_IN_LIEU_CAVEAT,
};
