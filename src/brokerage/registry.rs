use std::collections::BTreeMap;
use std::sync::Arc;

use super::client::BrokerageClient;
use super::error::BrokerageError;
use super::types::{AccountId, BrokerageId, SessionToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        }
    }

    fn can_move_to(&self, next: AuthState) -> bool {
        matches!(
            (self, next),
            (AuthState::Unauthenticated, AuthState::Authenticating)
                | (AuthState::Authenticating, AuthState::Authenticated)
                | (AuthState::Authenticating, AuthState::Failed)
        )
    }
}

/// One configured backend plus its authentication bookkeeping.
#[derive(Clone)]
pub struct ClientHandle {
    client: Arc<dyn BrokerageClient>,
    state: AuthState,
    session: Option<SessionToken>,
    accounts: Option<Arc<[AccountId]>>,
}

impl ClientHandle {
    pub fn new(client: Arc<dyn BrokerageClient>) -> Self {
        Self {
            client,
            state: AuthState::Unauthenticated,
            session: None,
            accounts: None,
        }
    }

    pub fn identity(&self) -> BrokerageId {
        self.client.identity()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn client(&self) -> Arc<dyn BrokerageClient> {
        self.client.clone()
    }

    pub fn session(&self) -> Option<&SessionToken> {
        self.session.as_ref()
    }

    pub(crate) fn set_session(&mut self, token: Option<SessionToken>) {
        self.session = token;
    }

    /// Accounts discovered at login. `None` when the handle never went
    /// through the coordinator; callers then ask the backend.
    pub fn accounts(&self) -> Option<&[AccountId]> {
        self.accounts.as_deref()
    }

    pub(crate) fn set_accounts(&mut self, accounts: Vec<AccountId>) {
        self.accounts = Some(accounts.into());
    }

    /// Moves the handle forward. State only ever advances
    /// Unauthenticated → Authenticating → {Authenticated, Failed}.
    pub fn transition(&mut self, next: AuthState) -> Result<(), BrokerageError> {
        if !self.state.can_move_to(next) {
            return Err(BrokerageError::InvalidTransition {
                identity: self.identity(),
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        tracing::debug!(
            "{} auth state: {} -> {}",
            self.identity(),
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        Ok(())
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("identity", &self.identity())
            .field("state", &self.state)
            .field("session", &self.session)
            .field("accounts", &self.accounts)
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Brokerage {0} configured twice")]
    Duplicate(BrokerageId),

    #[error("Brokerage {0} is not in the registry")]
    Unknown(BrokerageId),
}

/// Collects adapters before authentication.
#[derive(Default)]
pub struct RegistryBuilder {
    handles: BTreeMap<BrokerageId, ClientHandle>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client: Arc<dyn BrokerageClient>) -> Result<&mut Self, RegistryError> {
        let identity = client.identity();
        if self.handles.contains_key(&identity) {
            return Err(RegistryError::Duplicate(identity));
        }
        self.handles.insert(identity, ClientHandle::new(client));
        Ok(self)
    }

    pub fn with(mut self, client: Arc<dyn BrokerageClient>) -> Result<Self, RegistryError> {
        self.add(client)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn into_handles(self) -> Vec<ClientHandle> {
        self.handles.into_values().collect()
    }

    /// Freezes the configured set as-is, without authenticating.
    pub fn build(self) -> ClientRegistry {
        ClientRegistry::from_handles(self.into_handles())
    }
}

/// Immutable set of client handles. Shared behind an `Arc` by every engine;
/// nothing mutates it after construction.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    handles: BTreeMap<BrokerageId, ClientHandle>,
}

impl ClientRegistry {
    pub(crate) fn from_handles(handles: Vec<ClientHandle>) -> Self {
        Self {
            handles: handles.into_iter().map(|h| (h.identity(), h)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, identity: BrokerageId) -> Option<&ClientHandle> {
        self.handles.get(&identity)
    }

    pub fn identities(&self) -> Vec<BrokerageId> {
        self.handles.keys().copied().collect()
    }

    pub fn handles(&self) -> impl Iterator<Item = &ClientHandle> {
        self.handles.values()
    }

    /// Resolves a target subset to handles. `None` selects every client.
    pub fn select(
        &self,
        targets: Option<&[BrokerageId]>,
    ) -> Result<Vec<(BrokerageId, ClientHandle)>, RegistryError> {
        match targets {
            None => Ok(self
                .handles
                .iter()
                .map(|(id, h)| (*id, h.clone()))
                .collect()),
            Some(ids) => {
                let mut selected: Vec<(BrokerageId, ClientHandle)> = Vec::with_capacity(ids.len());
                for id in ids {
                    if selected.iter().any(|(seen, _)| seen == id) {
                        continue;
                    }
                    let handle = self.handles.get(id).ok_or(RegistryError::Unknown(*id))?;
                    selected.push((*id, handle.clone()));
                }
                Ok(selected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokerage::paper::PaperBrokerageClient;

    fn paper(id: BrokerageId) -> Arc<dyn BrokerageClient> {
        Arc::new(PaperBrokerageClient::new(id))
    }

    #[test]
    fn test_auth_state_is_monotonic() {
        let mut handle = ClientHandle::new(paper(BrokerageId::Schwab));
        assert_eq!(handle.state(), AuthState::Unauthenticated);

        assert!(handle.transition(AuthState::Authenticated).is_err());
        handle.transition(AuthState::Authenticating).unwrap();
        handle.transition(AuthState::Failed).unwrap();

        assert!(handle.transition(AuthState::Authenticated).is_err());
        assert!(handle.transition(AuthState::Authenticating).is_err());
        assert_eq!(handle.state(), AuthState::Failed);
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let result = RegistryBuilder::new()
            .with(paper(BrokerageId::Tradier))
            .and_then(|b| b.with(paper(BrokerageId::Tradier)));

        assert_eq!(result.err(), Some(RegistryError::Duplicate(BrokerageId::Tradier)));
    }

    #[test]
    fn test_select_subset_and_unknown() {
        let registry = RegistryBuilder::new()
            .with(paper(BrokerageId::Schwab))
            .and_then(|b| b.with(paper(BrokerageId::Public)))
            .unwrap()
            .build();

        assert_eq!(registry.select(None).unwrap().len(), 2);

        let subset = registry
            .select(Some(&[BrokerageId::Public, BrokerageId::Public]))
            .unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].0, BrokerageId::Public);

        assert_eq!(
            registry.select(Some(&[BrokerageId::Fennel])).err(),
            Some(RegistryError::Unknown(BrokerageId::Fennel))
        );
        assert!(subset[0].1.accounts().is_none());
    }

    #[test]
    fn test_accounts_travel_with_the_handle() {
        let mut handle = ClientHandle::new(paper(BrokerageId::Fennel));
        handle.set_accounts(vec![AccountId::new("F1"), AccountId::new("F2")]);

        let registry = ClientRegistry::from_handles(vec![handle]);
        let selected = registry.select(None).unwrap();
        assert_eq!(selected[0].1.accounts().map(|a| a.len()), Some(2));
    }
}
