use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CollaboratorError, SessionStore};
use crate::brokerage::{BrokerageId, SessionToken};

/// Process-local session store. Sessions survive for the life of the value
/// (clones share storage).
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<BrokerageId, SessionToken>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, identity: BrokerageId) -> bool {
        self.sessions.read().await.contains_key(&identity)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, identity: BrokerageId) -> Result<Option<SessionToken>, CollaboratorError> {
        Ok(self.sessions.read().await.get(&identity).cloned())
    }

    async fn save(&self, identity: BrokerageId, token: &SessionToken) -> Result<(), CollaboratorError> {
        self.sessions.write().await.insert(identity, token.clone());
        tracing::debug!("Stored session for {}", identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let store = InMemorySessionStore::new();
        assert!(store.load(BrokerageId::Bbae).await.unwrap().is_none());

        let token = SessionToken::new("cookie-jar");
        store.save(BrokerageId::Bbae, &token).await.unwrap();

        let shared = store.clone();
        assert_eq!(shared.load(BrokerageId::Bbae).await.unwrap(), Some(token));
        assert_eq!(shared.len().await, 1);
    }
}
