use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::brokerage::{BrokerageError, BrokerageId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Calls allowed in flight at once against one backend.
    pub max_concurrent: usize,
    /// Calls allowed to start inside one sliding window.
    pub max_requests: usize,
    pub window_duration_secs: u64,
    /// Retries after the backend itself answers "rate limited".
    pub max_backoff_retries: u32,
    pub base_backoff_ms: u64,
    /// Pause after every order attempt, drawn from `min..=max`. The
    /// brokerage's permit stays held for the pause.
    pub trade_delay_min_ms: u64,
    pub trade_delay_max_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_requests: 30,
            window_duration_secs: 60,
            max_backoff_retries: 3,
            base_backoff_ms: 500,
            trade_delay_min_ms: 4_000,
            trade_delay_max_ms: 6_000,
        }
    }
}

impl RateLimiterConfig {
    /// No pause between orders.
    pub fn unpaced(self) -> Self {
        Self {
            trade_delay_min_ms: 0,
            trade_delay_max_ms: 0,
            ..self
        }
    }
}

/// Per-backend limiter: a semaphore bounds concurrency, a sliding window
/// bounds request rate.
pub struct RateLimiter {
    identity: BrokerageId,
    config: RateLimiterConfig,
    semaphore: Arc<Semaphore>,
    request_times: Arc<RwLock<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(identity: BrokerageId, config: RateLimiterConfig) -> Self {
        Self {
            identity,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            request_times: Arc::new(RwLock::new(VecDeque::new())),
            config,
        }
    }

    pub fn identity(&self) -> BrokerageId {
        self.identity
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub async fn acquire(&self) -> Result<RateLimitPermit, BrokerageError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrokerageError::LimiterClosed)?;

        let window = Duration::from_secs(self.config.window_duration_secs);
        loop {
            let mut times = self.request_times.write().await;
            let now = Instant::now();

            while let Some(&front) = times.front() {
                if now.duration_since(front) >= window {
                    times.pop_front();
                } else {
                    break;
                }
            }

            if times.len() < self.config.max_requests.max(1) {
                times.push_back(now);
                return Ok(RateLimitPermit {
                    _permit: permit,
                    start_time: now,
                });
            }

            let Some(&oldest) = times.front() else {
                continue;
            };
            let wait_duration = (oldest + window).saturating_duration_since(now);
            warn!("⏳ {} rate limit reached, waiting {:?}", self.identity, wait_duration);
            drop(times);
            time::sleep(wait_duration).await;
        }
    }

    /// Runs one backend call under this limiter. A `RateLimited` answer from
    /// the backend releases the permit, backs off exponentially (or for the
    /// backend's hint), and retries up to `max_backoff_retries` times.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, BrokerageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerageError>>,
    {
        self.run_inner(op, false).await
    }

    /// [`run`](Self::run) for order placement: once the backend has
    /// answered, the permit is held for [`trade_delay`](Self::trade_delay)
    /// before the next call against this brokerage may start.
    pub async fn run_paced<T, F, Fut>(&self, op: F) -> Result<T, BrokerageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerageError>>,
    {
        self.run_inner(op, true).await
    }

    pub fn trade_delay(&self) -> Duration {
        let low = self.config.trade_delay_min_ms;
        let high = self.config.trade_delay_max_ms.max(low);
        let millis = if high > low {
            rand::rng().random_range(low..=high)
        } else {
            low
        };
        Duration::from_millis(millis)
    }

    async fn run_inner<T, F, Fut>(&self, mut op: F, paced: bool) -> Result<T, BrokerageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerageError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let permit = self.acquire().await?;
            let result = op().await;

            match result {
                Err(BrokerageError::RateLimited { retry_after_ms })
                    if attempt < self.config.max_backoff_retries =>
                {
                    drop(permit);
                    let backoff = retry_after_ms.unwrap_or_else(|| {
                        self.config
                            .base_backoff_ms
                            .saturating_mul(1u64 << attempt.min(16))
                    });
                    attempt += 1;
                    warn!(
                        "{} backend rate limited, backing off {}ms (attempt {}/{})",
                        self.identity, backoff, attempt, self.config.max_backoff_retries
                    );
                    time::sleep(Duration::from_millis(backoff)).await;
                }
                other => {
                    if paced {
                        let pause = self.trade_delay();
                        if !pause.is_zero() {
                            debug!("{} pacing next trade by {:?}", self.identity, pause);
                            time::sleep(pause).await;
                        }
                    }
                    drop(permit);
                    return other;
                }
            }
        }
    }

    pub async fn get_current_usage(&self) -> usize {
        let times = self.request_times.read().await;
        let window = Duration::from_secs(self.config.window_duration_secs);
        let now = Instant::now();
        times
            .iter()
            .filter(|&&t| now.duration_since(t) < window)
            .count()
    }

    pub async fn get_available_capacity(&self) -> usize {
        let usage = self.get_current_usage().await;
        self.config.max_requests.saturating_sub(usage)
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

pub struct RateLimitPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    start_time: Instant,
}

impl RateLimitPermit {
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// One independent limiter per brokerage, shared by every operation kind
/// aimed at that brokerage. Built once; lookups take no locks.
pub struct RateLimiterSet {
    limiters: [Arc<RateLimiter>; 8],
}

impl RateLimiterSet {
    pub fn new(default: RateLimiterConfig, overrides: &HashMap<BrokerageId, RateLimiterConfig>) -> Self {
        let limiters = BrokerageId::ALL.map(|id| {
            let config = overrides.get(&id).cloned().unwrap_or_else(|| default.clone());
            Arc::new(RateLimiter::new(id, config))
        });
        Self { limiters }
    }

    pub fn uniform(config: RateLimiterConfig) -> Self {
        Self::new(config, &HashMap::new())
    }

    pub fn get(&self, identity: BrokerageId) -> Arc<RateLimiter> {
        self.limiters[identity.ordinal()].clone()
    }
}

impl Default for RateLimiterSet {
    fn default() -> Self {
        Self::uniform(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_concurrent: usize, max_requests: usize) -> RateLimiterConfig {
        RateLimiterConfig {
            max_concurrent,
            max_requests,
            window_duration_secs: 1,
            max_backoff_retries: 3,
            base_backoff_ms: 100,
            trade_delay_min_ms: 0,
            trade_delay_max_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire() {
        let limiter = RateLimiter::new(BrokerageId::Schwab, config(5, 10));

        let permit = limiter.acquire().await;
        assert!(permit.is_ok());
        assert_eq!(limiter.get_current_usage().await, 1);
        assert_eq!(limiter.get_available_capacity().await, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_bound() {
        let limiter = Arc::new(RateLimiter::new(BrokerageId::Fennel, config(2, 100)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let (active, peak) = (&active, &peak);
                limiter
                    .run(move || async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, BrokerageError>(())
                    })
                    .await
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_budget_delays_excess_requests() {
        let limiter = RateLimiter::new(BrokerageId::Public, config(10, 2));
        let start = Instant::now();

        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_rate_limit_is_absorbed_by_backoff() {
        let limiter = RateLimiter::new(BrokerageId::Robinhood, config(1, 100));
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;

        let result = limiter
            .run(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BrokerageError::RateLimited { retry_after_ms: None })
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_retries() {
        let limiter = RateLimiter::new(BrokerageId::Bbae, config(1, 100));
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;

        let result: Result<(), _> = limiter
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BrokerageError::RateLimited { retry_after_ms: Some(10) })
            })
            .await;

        assert!(matches!(result, Err(BrokerageError::RateLimited { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let set = RateLimiterSet::uniform(config(1, 100));

        let _held = set.get(BrokerageId::Schwab).acquire().await.unwrap();
        assert_eq!(set.get(BrokerageId::Schwab).available_slots(), 0);

        let other = tokio::time::timeout(
            Duration::from_millis(100),
            set.get(BrokerageId::Tradier).acquire(),
        )
        .await;
        assert!(other.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_call_holds_permit_for_trade_delay() {
        let paced = RateLimiterConfig {
            trade_delay_min_ms: 4_000,
            trade_delay_max_ms: 6_000,
            ..config(1, 100)
        };
        let limiter = Arc::new(RateLimiter::new(BrokerageId::Schwab, paced));
        let start = Instant::now();

        limiter.run_paced(|| async { Ok::<_, BrokerageError>(()) }).await.unwrap();
        let paced_for = start.elapsed();
        assert!(paced_for >= Duration::from_secs(4));
        assert!(paced_for <= Duration::from_secs(6));

        // A read queued behind a paced order waits the pause out.
        let order = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.run_paced(|| async { Ok::<_, BrokerageError>(()) }).await })
        };
        tokio::task::yield_now().await;
        let read_start = Instant::now();
        limiter.run(|| async { Ok::<_, BrokerageError>(()) }).await.unwrap();
        assert!(read_start.elapsed() >= Duration::from_secs(4));
        order.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_and_plain_runs_are_not_paced() {
        let fixed = RateLimiterConfig {
            trade_delay_min_ms: 1_000,
            trade_delay_max_ms: 1_000,
            ..config(1, 100)
        };
        let limiter = RateLimiter::new(BrokerageId::Fennel, fixed);
        assert_eq!(limiter.trade_delay(), Duration::from_secs(1));

        let start = Instant::now();
        limiter.run(|| async { Ok::<_, BrokerageError>(()) }).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.run_paced(|| async { Ok::<_, BrokerageError>(()) }).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        let unpaced = RateLimiter::new(BrokerageId::Fennel, RateLimiterConfig::default().unpaced());
        assert_eq!(unpaced.trade_delay(), Duration::ZERO);
    }

    #[test]
    fn test_overrides_apply_per_identity() {
        let mut overrides = HashMap::new();
        overrides.insert(BrokerageId::Fennel, config(2, 5));
        let set = RateLimiterSet::new(config(1, 30), &overrides);

        assert_eq!(set.get(BrokerageId::Fennel).config().max_concurrent, 2);
        assert_eq!(set.get(BrokerageId::Schwab).config().max_concurrent, 1);
        assert_eq!(set.get(BrokerageId::Fennel).identity(), BrokerageId::Fennel);
    }
}
