pub mod rate_limiter;

pub use rate_limiter::{RateLimitPermit, RateLimiter, RateLimiterConfig, RateLimiterSet};
