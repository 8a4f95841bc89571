//! CSRF state tokens bound to one authorization attempt.
//!
//! A state is `{provider}-{nonce}` where the nonce is 16 bytes from the OS
//! seeded CSPRNG, hex encoded. It lives in the `oauth_state` slot of the
//! staging store, namespaced per provider, and is consumed by the first
//! validation that finds it.

use rand::RngCore as _;
use std::sync::Arc;
use stowage_types::{KeyValueStore, Provider, traits::Result};

const STATE_SLOT: &str = "oauth_state";

/// Storage key of the state slot for `provider`.
#[must_use]
pub fn state_key(provider: Provider) -> String {
    format!("{provider}_{STATE_SLOT}")
}

/// Generate a random nonce (hex-encoded, 32 lowercase hex chars).
#[must_use]
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(32), |mut s, b| {
        use std::fmt::Write as _;
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Issues and validates per-provider CSRF state tokens.
#[derive(Clone)]
pub struct StateTokens {
    store: Arc<dyn KeyValueStore>,
}

impl StateTokens {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Issue a fresh state for `provider`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn issue(&self, provider: Provider) -> Result<String> {
        let state = format!("{provider}-{}", random_nonce());
        self.store.set(&state_key(provider), &state).await?;
        Ok(state)
    }

    /// Check `received` against the last issued state for `provider`.
    ///
    /// The stored state is consumed whether or not it matches, so a state
    /// validates at most once and a rejected callback cannot be replayed
    /// against the same attempt.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store itself fails.
    pub async fn validate(&self, provider: Provider, received: Option<&str>) -> Result<bool> {
        let Some(stored) = self.store.take(&state_key(provider)).await? else {
            return Ok(false);
        };
        let Some(received) = received.filter(|s| !s.is_empty()) else {
            return Ok(false);
        };
        let prefixed = received.starts_with(&format!("{provider}-"));
        Ok(prefixed && constant_time_eq(stored.as_bytes(), received.as_bytes()))
    }

    /// The currently issued state, if an attempt is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn peek(&self, provider: Provider) -> Result<Option<String>> {
        self.store.get(&state_key(provider)).await
    }

    /// Drop the issued state without validating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn invalidate(&self, provider: Provider) -> Result<()> {
        self.store.remove(&state_key(provider)).await
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_store::MemoryStore;

    fn tokens() -> StateTokens {
        StateTokens::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_random_nonce_is_hex() {
        let s = random_nonce();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn test_random_nonce_different_each_call() {
        assert_ne!(random_nonce(), random_nonce());
    }

    #[tokio::test]
    async fn test_issue_format() {
        let t = tokens();
        let s = t.issue(Provider::Dropbox).await.unwrap();
        assert!(s.starts_with("dropbox-"));
        assert_eq!(s.len(), "dropbox-".len() + 32);
        let g = t.issue(Provider::GoogleDrive).await.unwrap();
        assert!(g.starts_with("google_drive-"));
    }

    #[tokio::test]
    async fn test_validate_exactly_once() {
        for &provider in Provider::all() {
            let t = tokens();
            let s = t.issue(provider).await.unwrap();
            assert!(t.validate(provider, Some(&s)).await.unwrap());
            assert!(!t.validate(provider, Some(&s)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_mismatch_and_empty() {
        let t = tokens();
        let _ = t.issue(Provider::Dropbox).await.unwrap();
        assert!(!t.validate(Provider::Dropbox, Some("garbage")).await.unwrap());

        let _ = t.issue(Provider::Dropbox).await.unwrap();
        assert!(!t.validate(Provider::Dropbox, Some("")).await.unwrap());

        let _ = t.issue(Provider::Dropbox).await.unwrap();
        assert!(!t.validate(Provider::Dropbox, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_without_issue() {
        let t = tokens();
        assert!(!t.validate(Provider::Dropbox, Some("dropbox-abc")).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatch_consumes_stored_state() {
        let t = tokens();
        let s = t.issue(Provider::Dropbox).await.unwrap();
        assert!(!t.validate(Provider::Dropbox, Some("dropbox-forged")).await.unwrap());
        assert!(!t.validate(Provider::Dropbox, Some(&s)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reissue_invalidates_previous() {
        let t = tokens();
        let old = t.issue(Provider::Dropbox).await.unwrap();
        let new = t.issue(Provider::Dropbox).await.unwrap();
        assert_ne!(old, new);
        assert!(!t.validate(Provider::Dropbox, Some(&old)).await.unwrap());

        let fresh = t.issue(Provider::Dropbox).await.unwrap();
        assert!(t.validate(Provider::Dropbox, Some(&fresh)).await.unwrap());
    }

    #[tokio::test]
    async fn test_providers_do_not_share_slot() {
        let t = tokens();
        let d = t.issue(Provider::Dropbox).await.unwrap();
        let g = t.issue(Provider::GoogleDrive).await.unwrap();
        assert!(t.validate(Provider::Dropbox, Some(&d)).await.unwrap());
        assert!(t.validate(Provider::GoogleDrive, Some(&g)).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_of_other_provider_rejected() {
        let t = tokens();
        let g = t.issue(Provider::GoogleDrive).await.unwrap();
        let _ = t.issue(Provider::Dropbox).await.unwrap();
        assert!(!t.validate(Provider::Dropbox, Some(&g)).await.unwrap());
    }

    #[tokio::test]
    async fn test_peek_and_invalidate() {
        let t = tokens();
        assert!(t.peek(Provider::Dropbox).await.unwrap().is_none());
        let s = t.issue(Provider::Dropbox).await.unwrap();
        assert_eq!(t.peek(Provider::Dropbox).await.unwrap(), Some(s.clone()));
        t.invalidate(Provider::Dropbox).await.unwrap();
        assert!(!t.validate(Provider::Dropbox, Some(&s)).await.unwrap());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
