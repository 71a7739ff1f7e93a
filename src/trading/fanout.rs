//! Dispatch-per-client, collect-with-timeout.
//!
//! Every multi-brokerage operation (login, balances, holdings, orders) goes
//! through [`fan_out`]: one tokio task per target, each bounded by its own
//! timeout and by a shared cancellation signal. The caller always gets back
//! exactly one outcome per target, whatever happened to the task.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::brokerage::{AccountId, BrokerageError, BrokerageId, ClientHandle};
use crate::limits::RateLimiter;

/// How one dispatched task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Completed(T),
    TimedOut,
    Cancelled,
    Panicked(String),
}

/// Triggers cancellation for every [`CancelSignal`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs `op` once per target on its own task and waits for all of them.
///
/// A slow, failing or panicking target only affects its own entry. On
/// cancellation, tasks still running are dropped; outcomes that already
/// completed are kept. Output order follows `targets`.
pub async fn fan_out<C, T, F, Fut>(
    targets: Vec<(BrokerageId, C)>,
    timeout: Duration,
    cancel: &CancelSignal,
    op: F,
) -> Vec<(BrokerageId, TaskOutcome<T>)>
where
    C: Send + 'static,
    T: Send + 'static,
    F: Fn(BrokerageId, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let op = Arc::new(op);
    let mut identities = Vec::with_capacity(targets.len());
    let mut handles = Vec::with_capacity(targets.len());

    for (identity, target) in targets {
        let op = op.clone();
        let mut cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            if cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => TaskOutcome::Cancelled,
                result = tokio::time::timeout(timeout, op(identity, target)) => match result {
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(_) => TaskOutcome::TimedOut,
                },
            }
        });

        identities.push(identity);
        handles.push(handle);
    }

    let joined = join_all(handles).await;

    identities
        .into_iter()
        .zip(joined)
        .map(|(identity, joined)| {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    tracing::error!("❌ {} task panicked: {}", identity, e);
                    TaskOutcome::Panicked(e.to_string())
                }
                Err(_) => TaskOutcome::Cancelled,
            };
            (identity, outcome)
        })
        .collect()
}

/// Bounds one backend call. Running out of time becomes
/// [`BrokerageError::Timeout`].
pub async fn within<T, Fut>(limit: Duration, call: Fut) -> Result<T, BrokerageError>
where
    Fut: Future<Output = Result<T, BrokerageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerageError::Timeout(
            u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

/// Accounts a per-brokerage task works through: the ones recorded at login,
/// or a fresh listing when the handle never went through the coordinator.
pub async fn accounts_for(
    handle: &ClientHandle,
    limiter: &RateLimiter,
    limit: Duration,
) -> Result<Vec<AccountId>, BrokerageError> {
    if let Some(accounts) = handle.accounts() {
        return Ok(accounts.to_vec());
    }
    let client = handle.client();
    let client = client.as_ref();
    limiter.run(|| within(limit, client.accounts())).await
}
