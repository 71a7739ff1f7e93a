//! Coordinated trading across several retail brokerage accounts.
//!
//! One login pass authenticates every configured backend, then orders,
//! balance reads and holdings reads fan out to all of them concurrently,
//! each brokerage throttled by its own limiter.

pub mod auth;
pub mod brokerage;
pub mod core;
pub mod limits;
pub mod market;
pub mod portfolio;
pub mod trading;
