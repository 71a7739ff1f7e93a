use async_trait::async_trait;
use std::collections::HashMap;
use std::env;

use super::{CollaboratorError, CredentialProvider};
use crate::brokerage::{BrokerageId, Credentials};

/// Reads `<BROKERAGE>_<KEY>` environment variables, e.g. `SCHWAB_API_KEY`
/// becomes key `api_key` in the Schwab bundle. Values are passed through
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    pub fn new() -> Self {
        dotenv::dotenv().ok();
        Self
    }

    fn collect(identity: BrokerageId, vars: impl Iterator<Item = (String, String)>) -> Credentials {
        let prefix = format!("{}_", identity.as_str().to_uppercase());
        vars.filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_lowercase(), value))
        })
        .fold(Credentials::new(), |creds, (key, value)| creds.with(key, value))
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credentials(&self, identity: BrokerageId) -> Result<Credentials, CollaboratorError> {
        let credentials = Self::collect(identity, env::vars());
        if credentials.is_empty() {
            return Err(CollaboratorError::MissingCredentials(identity));
        }
        Ok(credentials)
    }
}

/// Fixed credential table, mainly for tests and paper runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    credentials: HashMap<BrokerageId, Credentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, identity: BrokerageId, credentials: Credentials) -> Self {
        self.credentials.insert(identity, credentials);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credentials(&self, identity: BrokerageId) -> Result<Credentials, CollaboratorError> {
        Ok(self.credentials.get(&identity).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix_mapping() {
        let vars = vec![
            ("SCHWAB_API_KEY".to_string(), "key".to_string()),
            ("SCHWAB_API_SECRET".to_string(), "secret".to_string()),
            ("TRADIER_API_KEY".to_string(), "other".to_string()),
            ("SCHWAB_".to_string(), "ignored".to_string()),
        ];

        let creds = EnvCredentialProvider::collect(BrokerageId::Schwab, vars.into_iter());
        assert_eq!(creds.get("api_key"), Some("key"));
        assert_eq!(creds.get("api_secret"), Some("secret"));
        assert_eq!(creds.get(""), None);
        assert!(EnvCredentialProvider::collect(BrokerageId::Fennel, std::iter::empty()).is_empty());
    }

    #[tokio::test]
    async fn test_static_provider_defaults_to_empty() {
        let provider = StaticCredentialProvider::new()
            .with(BrokerageId::Public, Credentials::new().with("password", "pw"));

        let public = provider.get_credentials(BrokerageId::Public).await.unwrap();
        assert_eq!(public.get("password"), Some("pw"));
        assert!(provider.get_credentials(BrokerageId::Dspac).await.unwrap().is_empty());
    }
}
