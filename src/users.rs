//! Operator credentials stored next to the routes, one bcrypt hash per key

use crate::error::{Error, Lookup, Result};
use crate::keyspace::{KeySpace, Namespace};
use crate::kv::SharedKvBackend;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Salted one-way hashing of operator passwords
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, password: &str) -> Result<String>;

    async fn verify(&self, password: &str, hash: &str) -> Result<bool>;
}

/// bcrypt on the blocking pool; each hash gets a fresh random salt
#[derive(Debug, Clone, Copy)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

#[async_trait]
impl PasswordHasher for BcryptHasher {
    async fn hash(&self, password: &str) -> Result<String> {
        let password = password.to_string();
        let cost = self.cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| Error::Hashing(e.to_string()))?
            .map_err(|e| Error::Hashing(e.to_string()))
    }

    async fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| Error::Hashing(e.to_string()))?
            .map_err(|e| Error::Hashing(e.to_string()))
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    kv: SharedKvBackend,
    keys: KeySpace,
    hasher: Arc<dyn PasswordHasher>,
}

impl CredentialStore {
    pub fn new(kv: SharedKvBackend, keys: KeySpace, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self { kv, keys, hasher }
    }

    /// Verify a password; an unknown user is a plain `false`
    pub async fn login(&self, username: &str, password: &str) -> Result<bool> {
        let key = self.keys.encode_user_key(username);
        let Some(hash) = self.kv.get(&key).await? else {
            warn!(username, "Login for unknown user");
            return Ok(false);
        };

        let ok = self.hasher.verify(password, &hash).await?;
        if !ok {
            warn!(username, "Login failed");
        }
        Ok(ok)
    }

    /// Usernames matching the glob, sorted; empty means all
    pub async fn lookup(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = self.keys.match_pattern(Namespace::Users, pattern);
        let mut users = self
            .kv
            .keys(&glob)
            .await?
            .iter()
            .map(|key| self.keys.decode_user_key(key))
            .collect::<Result<Vec<_>>>()?;
        users.sort();
        debug!(pattern, count = users.len(), "Listed users");
        Ok(users)
    }

    /// The username if a credential exists; the hash never leaves this type
    pub async fn get(&self, username: &str) -> Result<Lookup<String>> {
        let key = self.keys.encode_user_key(username);
        Ok(self
            .kv
            .get(&key)
            .await?
            .map(|_| username.to_string())
            .into())
    }

    /// Hash and store, replacing any existing credential
    pub async fn insert(&self, username: &str, password: &str) -> Result<()> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(Error::validation("password", "must not be empty"));
        }

        let hash = self.hasher.hash(password).await?;
        self.kv.set(&self.keys.encode_user_key(username), &hash).await?;
        info!(username, "Credential stored");
        Ok(())
    }

    /// Password change; same write as `insert`
    pub async fn update(&self, username: &str, password: &str) -> Result<()> {
        self.insert(username, password).await
    }

    pub async fn delete(&self, username: &str) -> Result<bool> {
        let existed = self.kv.delete(&self.keys.encode_user_key(username)).await?;
        if existed {
            info!(username, "Credential deleted");
        }
        Ok(existed)
    }

    /// Create the first account; does nothing once any credential exists
    pub async fn bootstrap(&self, username: &str, password: &str) -> Result<bool> {
        if !self.lookup("").await?.is_empty() {
            debug!("Credentials present; skipping bootstrap user");
            return Ok(false);
        }
        self.insert(username, password).await?;
        info!(username, "Bootstrap user created");
        Ok(true)
    }
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(Error::validation("username", "must not be empty"));
    }
    // ':' would make HTTP Basic credentials ambiguous
    if username.contains(':') || username.contains(char::is_whitespace) {
        return Err(Error::validation(
            "username",
            format!("{:?} must not contain ':' or whitespace", username),
        ));
    }
    if username.contains(['*', '?', '[', ']', '\\']) {
        return Err(Error::validation(
            "username",
            format!("{:?} must not contain glob characters", username),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvBackend, MemoryBackend};

    fn store() -> (Arc<MemoryBackend>, CredentialStore) {
        let kv = Arc::new(MemoryBackend::new());
        let store = CredentialStore::new(
            kv.clone(),
            KeySpace::new("proxy"),
            Arc::new(BcryptHasher::new(4)),
        );
        (kv, store)
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let (_, users) = store();
        users.insert("alice", "s3cret").await.unwrap();

        assert!(users.login("alice", "s3cret").await.unwrap());
        assert!(!users.login("alice", "wrong").await.unwrap());
        assert!(!users.login("bob", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_is_stored_not_password() {
        let (kv, users) = store();
        users.insert("alice", "s3cret").await.unwrap();

        let stored = kv.snapshot().get("proxy:users:alice").cloned().unwrap();
        assert_ne!(stored, "s3cret");
        assert!(stored.starts_with("$2"));
    }

    #[tokio::test]
    async fn test_fresh_salt_per_insert() {
        let (kv, users) = store();
        users.insert("alice", "same").await.unwrap();
        let first = kv.snapshot().get("proxy:users:alice").cloned();
        users.update("alice", "same").await.unwrap();
        let second = kv.snapshot().get("proxy:users:alice").cloned();
        assert_ne!(first, second);
        assert!(users.login("alice", "same").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_changes_password() {
        let (_, users) = store();
        users.insert("alice", "old").await.unwrap();
        users.update("alice", "new").await.unwrap();
        assert!(!users.login("alice", "old").await.unwrap());
        assert!(users.login("alice", "new").await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_and_get() {
        let (kv, users) = store();
        users.insert("bob", "pw").await.unwrap();
        users.insert("alice", "pw").await.unwrap();
        kv.set("proxy:routes:a.com:/", "svc").await.unwrap();

        assert_eq!(users.lookup("").await.unwrap(), vec!["alice", "bob"]);
        assert_eq!(users.lookup("a*").await.unwrap(), vec!["alice"]);
        assert_eq!(
            users.get("alice").await.unwrap(),
            Lookup::Found("alice".to_string())
        );
        assert_eq!(users.get("carol").await.unwrap(), Lookup::NotFound);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_, users) = store();
        users.insert("alice", "pw").await.unwrap();
        assert!(users.delete("alice").await.unwrap());
        assert!(!users.delete("alice").await.unwrap());
        assert!(!users.login("alice", "pw").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_bad_username() {
        let (kv, users) = store();
        for name in ["", "a:b", "a b", "adm*"] {
            assert!(matches!(
                users.insert(name, "pw").await,
                Err(Error::Validation { field: "username", .. })
            ));
        }
        assert!(matches!(
            users.insert("alice", "").await,
            Err(Error::Validation { field: "password", .. })
        ));
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_only_when_empty() {
        let (_, users) = store();
        assert!(users.bootstrap("admin", "first").await.unwrap());
        assert!(!users.bootstrap("admin", "second").await.unwrap());
        assert!(users.login("admin", "first").await.unwrap());
    }
}
