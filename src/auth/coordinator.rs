use std::collections::BTreeMap;
use std::sync::Arc;

use super::decision::DecisionHandler;
use super::error::AuthError;
use crate::brokerage::{
    AccountId, AuthResult, AuthState, BrokerageClient, BrokerageId, ClientHandle, ClientRegistry,
    RegistryBuilder, SessionToken,
};
use crate::core::config::AuthConfig;
use crate::limits::{RateLimiter, RateLimiterSet};
use crate::market::{CredentialProvider, SessionStore};
use crate::trading::fanout::{fan_out, within, CancelSignal, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    NotStarted,
    InProgress,
    FullyAuthenticated,
    PartiallyAuthenticated,
    Aborted,
}

#[derive(Debug)]
pub struct AuthOutcome {
    pub state: CoordinatorState,
    /// One entry per configured brokerage.
    pub results: Vec<AuthResult>,
    registry: Option<Arc<ClientRegistry>>,
}

impl AuthOutcome {
    pub fn failed(&self) -> Vec<BrokerageId> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.identity)
            .collect()
    }

    pub fn registry(&self) -> Option<&Arc<ClientRegistry>> {
        self.registry.as_ref()
    }

    /// The authenticated-only registry, or why there is none.
    pub fn into_registry(self) -> Result<Arc<ClientRegistry>, AuthError> {
        if let Some(registry) = self.registry {
            return Ok(registry);
        }
        if self.results.iter().any(|r| r.success) {
            Err(AuthError::Aborted {
                failed: self.failed(),
            })
        } else {
            Err(AuthError::NoUsableClients)
        }
    }
}

/// Collaborators every login task reads from.
struct LoginContext {
    credentials: Arc<dyn CredentialProvider>,
    sessions: Arc<dyn SessionStore>,
    limiters: Arc<RateLimiterSet>,
    config: AuthConfig,
}

/// Logs every configured brokerage in at once, then decides whether the
/// session may go on.
///
/// Runs exactly once: NotStarted → InProgress → one of FullyAuthenticated,
/// PartiallyAuthenticated or Aborted. When some logins fail and others
/// succeed, the [`DecisionHandler`] chooses between carrying on with the
/// survivors and aborting.
pub struct AuthCoordinator {
    context: Arc<LoginContext>,
    decision: Arc<dyn DecisionHandler>,
    state: CoordinatorState,
}

impl AuthCoordinator {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        sessions: Arc<dyn SessionStore>,
        decision: Arc<dyn DecisionHandler>,
        limiters: Arc<RateLimiterSet>,
        config: AuthConfig,
    ) -> Self {
        Self {
            context: Arc::new(LoginContext {
                credentials,
                sessions,
                limiters,
                config,
            }),
            decision,
            state: CoordinatorState::NotStarted,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub async fn authenticate_all(
        &mut self,
        builder: RegistryBuilder,
        cancel: &CancelSignal,
    ) -> Result<AuthOutcome, AuthError> {
        if self.state != CoordinatorState::NotStarted {
            return Err(AuthError::AlreadyStarted);
        }
        if builder.is_empty() {
            return Err(AuthError::NoClientsConfigured);
        }
        self.state = CoordinatorState::InProgress;

        let mut handles: BTreeMap<BrokerageId, ClientHandle> = builder
            .into_handles()
            .into_iter()
            .map(|h| (h.identity(), h))
            .collect();

        tracing::info!("🔐 Authenticating {} brokerages", handles.len());

        let mut targets = Vec::with_capacity(handles.len());
        for (identity, handle) in handles.iter_mut() {
            if let Err(e) = handle.transition(AuthState::Authenticating) {
                tracing::error!("{}", e);
            }
            targets.push((*identity, handle.client()));
        }

        let context = self.context.clone();
        let timeout = self.context.config.timeout();
        let outcomes = fan_out(targets, timeout, cancel, move |identity, client| {
            let context = context.clone();
            async move { login(identity, client, context).await }
        })
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (identity, outcome) in outcomes {
            let (result, granted) = match outcome {
                TaskOutcome::Completed(Ok(granted)) => (AuthResult::succeeded(identity), Some(granted)),
                TaskOutcome::Completed(Err(reason)) => (AuthResult::failed(identity, reason), None),
                TaskOutcome::TimedOut => (
                    AuthResult::failed(identity, format!("no response within {}s", timeout.as_secs())),
                    None,
                ),
                TaskOutcome::Cancelled => (AuthResult::failed(identity, "cancelled"), None),
                TaskOutcome::Panicked(reason) => {
                    (AuthResult::failed(identity, format!("task panicked: {}", reason)), None)
                }
            };

            if let Some(handle) = handles.get_mut(&identity) {
                let next = if result.success {
                    AuthState::Authenticated
                } else {
                    AuthState::Failed
                };
                if let Err(e) = handle.transition(next) {
                    tracing::error!("{}", e);
                }
                if let Some(granted) = granted {
                    tracing::debug!("{} has {} accounts", identity, granted.accounts.len());
                    handle.set_session(granted.session);
                    handle.set_accounts(granted.accounts);
                }
            }

            match &result.failure_reason {
                None => tracing::info!("✅ {} authenticated", identity),
                Some(reason) => tracing::error!("❌ {} authentication failed: {}", identity, reason),
            }
            results.push(result);
        }

        let failed: Vec<BrokerageId> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.identity)
            .collect();
        let authenticated: Vec<ClientHandle> = handles
            .into_values()
            .filter(|h| h.state() == AuthState::Authenticated)
            .collect();

        let state = if authenticated.is_empty() {
            tracing::error!("🛑 No brokerage authenticated successfully");
            CoordinatorState::Aborted
        } else if failed.is_empty() {
            CoordinatorState::FullyAuthenticated
        } else {
            tracing::warn!("⚠️ Failed to authenticate: {:?}", failed);
            if self.decision.decide(&failed).await {
                CoordinatorState::PartiallyAuthenticated
            } else {
                tracing::warn!("🛑 Aborting at user request");
                CoordinatorState::Aborted
            }
        };
        self.state = state;

        let registry = match state {
            CoordinatorState::FullyAuthenticated | CoordinatorState::PartiallyAuthenticated => {
                tracing::info!(
                    "🔓 Authentication complete: {}/{} brokerages ready",
                    authenticated.len(),
                    results.len()
                );
                Some(Arc::new(ClientRegistry::from_handles(authenticated)))
            }
            _ => None,
        };

        Ok(AuthOutcome {
            state,
            results,
            registry,
        })
    }
}

/// What a successful login leaves on the handle.
struct Granted {
    session: Option<SessionToken>,
    accounts: Vec<AccountId>,
}

/// One brokerage's login: stored session first, then credentials. Returns
/// the session and the accounts it can reach, or a failure reason.
async fn login(
    identity: BrokerageId,
    client: Arc<dyn BrokerageClient>,
    context: Arc<LoginContext>,
) -> Result<Granted, String> {
    let client = client.as_ref();
    let limiter = context.limiters.get(identity);
    let persist = !identity.requires_step_up();

    if persist {
        if let Some(token) = stored_session(identity, context.as_ref()).await {
            match limiter.run(|| client.resume_session(&token)).await {
                Ok(()) => match verify_access(identity, client, &limiter, &context.config).await {
                    Ok(accounts) => {
                        tracing::info!("🔁 {} resumed stored session", identity);
                        return Ok(Granted {
                            session: Some(token),
                            accounts,
                        });
                    }
                    Err(reason) => tracing::debug!("{} resumed session unusable: {}", identity, reason),
                },
                Err(e) => tracing::debug!("{} stored session rejected: {}", identity, e),
            }
        }
    }

    let credentials = context
        .credentials
        .get_credentials(identity)
        .await
        .map_err(|e| e.to_string())?;

    let session = match limiter.run(|| client.authenticate(&credentials)).await {
        Ok(session) => session,
        Err(e) if e.is_retryable_auth() => {
            tracing::warn!("🔄 {} login failed ({}), retrying once", identity, e);
            limiter
                .run(|| client.authenticate(&credentials))
                .await
                .map_err(|e| e.to_string())?
        }
        Err(e) => return Err(e.to_string()),
    };

    let accounts = verify_access(identity, client, &limiter, &context.config).await?;

    if persist {
        if let Some(token) = &session {
            if let Err(e) = context.sessions.save(identity, token).await {
                tracing::warn!("⚠️ {} session not saved: {}", identity, e);
            }
        }
    }
    Ok(Granted { session, accounts })
}

async fn stored_session(identity: BrokerageId, context: &LoginContext) -> Option<SessionToken> {
    match context.sessions.load(identity).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!("⚠️ {} session lookup failed: {}", identity, e);
            None
        }
    }
}

/// Lists the accounts the session can reach; a login with none is
/// unusable. When verification is on, the first account's balance is read
/// once to prove the session works.
async fn verify_access(
    identity: BrokerageId,
    client: &dyn BrokerageClient,
    limiter: &RateLimiter,
    config: &AuthConfig,
) -> Result<Vec<AccountId>, String> {
    let bound = config.verify_timeout();
    let accounts = limiter
        .run(|| within(bound, client.accounts()))
        .await
        .map_err(|e| format!("account lookup failed: {}", e))?;
    let Some(first) = accounts.first() else {
        return Err("no accounts found".to_string());
    };

    if config.verify_account_access {
        limiter
            .run(|| within(bound, client.get_balance(first)))
            .await
            .map_err(|e| format!("account verification failed: {}", e))?;
        tracing::debug!("{} account access verified", identity);
    }
    Ok(accounts)
}
