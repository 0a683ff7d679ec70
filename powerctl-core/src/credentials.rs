use crate::types::BmcCredential;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Resolves a credential id from the mapping cache to a usable BMC
/// credential. Secret storage itself is an external collaborator; the core
/// only ever sees resolved values, read through per dispatch and never
/// cached across restarts.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_id: &str) -> Result<BmcCredential>;
}

/// Reads credentials from the process environment:
/// `POWERCTL_CRED_<ID>_USERNAME` / `POWERCTL_CRED_<ID>_PASSWORD`, with the
/// id uppercased and dashes mapped to underscores.
pub struct EnvCredentialResolver;

impl EnvCredentialResolver {
    fn env_key(credential_id: &str, field: &str) -> String {
        let id = credential_id.to_uppercase().replace('-', "_");
        format!("POWERCTL_CRED_{id}_{field}")
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, credential_id: &str) -> Result<BmcCredential> {
        let user_key = Self::env_key(credential_id, "USERNAME");
        let pass_key = Self::env_key(credential_id, "PASSWORD");
        let username = std::env::var(&user_key)
            .map_err(|_| anyhow!("credential {credential_id}: {user_key} not set"))?;
        let password = std::env::var(&pass_key)
            .map_err(|_| anyhow!("credential {credential_id}: {pass_key} not set"))?;
        Ok(BmcCredential { username, password })
    }
}

/// Fixed-map resolver for tests and development.
pub struct StaticCredentialResolver {
    credentials: HashMap<String, BmcCredential>,
}

impl StaticCredentialResolver {
    pub fn new(credentials: HashMap<String, BmcCredential>) -> Self {
        Self { credentials }
    }

    /// Single credential under one id.
    pub fn single(credential_id: &str, username: &str, password: &str) -> Self {
        let mut credentials = HashMap::new();
        credentials.insert(
            credential_id.to_string(),
            BmcCredential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        Self { credentials }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, credential_id: &str) -> Result<BmcCredential> {
        self.credentials
            .get(credential_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown credential id: {credential_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_lookup() {
        let resolver = StaticCredentialResolver::single("cred-x", "root", "hunter2");
        let cred = resolver.resolve("cred-x").await.unwrap();
        assert_eq!(cred.username, "root");
        assert!(resolver.resolve("cred-y").await.is_err());
    }

    #[test]
    fn env_key_shape() {
        assert_eq!(
            EnvCredentialResolver::env_key("cred-x", "USERNAME"),
            "POWERCTL_CRED_CRED_X_USERNAME"
        );
    }
}
