//! Credential handling: the `CredentialStore` seam and an in-memory
//! reference implementation.
//!
//! spec.md §1 names credential persistence as an external collaborator
//! ("opaque key-value interface: save, delete, verify, existence-check,
//! health"). `CredentialStore` is that seam; a real deployment backs it with
//! its own store. The in-memory implementation here exists so the gateway
//! is runnable standalone and so the registries/service layer have
//! something concrete to exercise in tests.

use mip_core::{TunnelError, TunnelResult};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Which public surface a credential is routed through. Fixed at issue
/// time and consulted at registration (spec.md §9's open question on
/// ambiguous-type credentials: there is no ambiguous case, because a
/// credential's kind never changes after `issue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Http,
    Tcp,
}

/// A minted credential. `secret` is opaque to everything except `verify`.
#[derive(Debug, Clone)]
pub struct Token {
    pub key_id: String,
    pub secret: String,
    pub kind: CredentialKind,
    pub expires_at: Instant,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// The credential persistence seam. Implementations need not be in-memory;
/// the gateway only ever talks to this trait.
pub trait CredentialStore: Send + Sync {
    /// Verify a (keyID, secret) pair, returning the credential's kind on
    /// success.
    fn verify<'a>(
        &'a self,
        key_id: &'a str,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<CredentialKind>> + Send + 'a>>;

    /// Whether any credential (expired or not) is registered under `key_id`.
    /// Used by the edges to distinguish `KeyIdNotFound` (404) from
    /// `FailedToConnect` (502) per spec.md §4.4 step 1.
    fn key_exists<'a>(&'a self, key_id: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Persist a newly minted token. Fails with `DuplicateTokenId` if the
    /// keyID is already taken.
    fn save<'a>(&'a self, token: Token) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;

    /// Revoke a credential by keyID. Idempotent: deleting an unknown keyID
    /// is not an error.
    fn delete<'a>(&'a self, key_id: &'a str) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;

    /// Liveness probe for the store itself.
    fn health<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// keyID alphabet, resolved per spec.md §9's open question: lowercase
/// letters and digits, 1-20 characters.
pub fn validate_key_id(key_id: &str) -> TunnelResult<()> {
    if key_id.is_empty() || key_id.len() > 20 {
        return Err(TunnelError::InvalidToken(format!(
            "keyID length must be 1-20, got {}",
            key_id.len()
        )));
    }
    if !key_id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(TunnelError::InvalidToken(
            "keyID must be lowercase letters and digits only".into(),
        ));
    }
    Ok(())
}

/// In-memory `CredentialStore`. Suitable for local runs and tests; not
/// durable across restarts (consistent with spec.md §1's non-goals, which
/// apply to live *connection* state but make no promise about credentials
/// either way once no external store is plugged in).
pub struct InMemoryCredentialStore {
    tokens: RwLock<HashMap<String, Token>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Mint and persist a new credential. Returns the generated secret.
    pub async fn issue(
        &self,
        key_id: &str,
        kind: CredentialKind,
        ttl: Duration,
    ) -> TunnelResult<String> {
        validate_key_id(key_id)?;
        let secret = generate_secret();
        let token = Token {
            key_id: key_id.to_string(),
            secret: secret.clone(),
            kind,
            expires_at: Instant::now() + ttl,
        };
        self.save(token).await?;
        Ok(secret)
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn verify<'a>(
        &'a self,
        key_id: &'a str,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<CredentialKind>> + Send + 'a>> {
        Box::pin(async move {
            let tokens = self.tokens.read().await;
            match tokens.get(key_id) {
                Some(tok) if tok.is_expired() => {
                    Err(TunnelError::AuthFailed("credential expired".into()))
                }
                Some(tok) if tok.secret == secret => Ok(tok.kind),
                Some(_) => Err(TunnelError::AuthFailed("secret mismatch".into())),
                None => Err(TunnelError::AuthFailed("unknown keyID".into())),
            }
        })
    }

    fn key_exists<'a>(&'a self, key_id: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move { self.tokens.read().await.contains_key(key_id) })
    }

    fn save<'a>(&'a self, token: Token) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut tokens = self.tokens.write().await;
            if tokens.contains_key(&token.key_id) {
                return Err(TunnelError::DuplicateTokenId(token.key_id));
            }
            tokens.insert(token.key_id.clone(), token);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key_id: &'a str) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.tokens.write().await.remove(key_id);
            Ok(())
        })
    }

    fn health<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move { true })
    }
}

pub(crate) fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_alphabet() {
        assert!(validate_key_id("alpha").is_ok());
        assert!(validate_key_id("a1b2c3").is_ok());
        assert!(validate_key_id("").is_err());
        assert!(validate_key_id("UPPER").is_err());
        assert!(validate_key_id(&"a".repeat(21)).is_err());
        assert!(validate_key_id(&"a".repeat(20)).is_ok());
    }

    #[tokio::test]
    async fn issue_then_verify() {
        let store = InMemoryCredentialStore::new();
        let secret = store
            .issue("alpha", CredentialKind::Http, Duration::from_secs(60))
            .await
            .unwrap();

        let kind = store.verify("alpha", &secret).await.unwrap();
        assert_eq!(kind, CredentialKind::Http);

        assert!(store.verify("alpha", "wrong").await.is_err());
        assert!(store.verify("ghost", &secret).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_issue_rejected() {
        let store = InMemoryCredentialStore::new();
        store
            .issue("alpha", CredentialKind::Tcp, Duration::from_secs(60))
            .await
            .unwrap();
        let err = store
            .issue("alpha", CredentialKind::Tcp, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateTokenId(_)));
    }

    #[tokio::test]
    async fn key_exists_independent_of_verify() {
        let store = InMemoryCredentialStore::new();
        assert!(!store.key_exists("alpha").await);
        store
            .issue("alpha", CredentialKind::Http, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.key_exists("alpha").await);
        assert!(store.verify("alpha", "wrong-secret").await.is_err());
        assert!(store.key_exists("alpha").await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryCredentialStore::new();
        store.delete("ghost").await.unwrap();
        store
            .issue("alpha", CredentialKind::Http, Duration::from_secs(60))
            .await
            .unwrap();
        store.delete("alpha").await.unwrap();
        store.delete("alpha").await.unwrap();
        assert!(!store.key_exists("alpha").await);
    }
}
