//! Provider-scoped staging of client credentials between "start" and
//! "callback arrives".
//!
//! The callback runs in a different context than the one that started the
//! flow, so the material the exchange needs is handed over through the shared
//! [`KeyValueStore`]. Keys: `{provider}_client_id`, `{provider}_client_secret`
//! and `{provider}_token` (a completed token waiting for its opener).

use secrecy::{ExposeSecret as _, SecretString};
use std::sync::Arc;
use stowage_types::{KeyValueStore, Provider, StowageError, traits::Result};

fn client_id_key(provider: Provider) -> String {
    format!("{provider}_client_id")
}

fn client_secret_key(provider: Provider) -> String {
    format!("{provider}_client_secret")
}

fn token_key(provider: Provider) -> String {
    format!("{provider}_token")
}

/// Client credentials read back in the callback context.
#[derive(Debug)]
pub struct StagedCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Clone)]
pub struct CredentialStaging {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStaging {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stage credentials for `provider`, overwriting whatever a previous
    /// attempt left behind (including an unclaimed token).
    ///
    /// # Errors
    ///
    /// Returns an error if a store write fails.
    pub async fn stage(
        &self,
        provider: Provider,
        client_id: &str,
        client_secret: &SecretString,
    ) -> Result<()> {
        self.store.remove(&token_key(provider)).await?;
        self.store.set(&client_id_key(provider), client_id).await?;
        self.store
            .set(&client_secret_key(provider), client_secret.expose_secret())
            .await
    }

    /// Read staged credentials for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::CredentialsNotFound`] unless both the id and the
    /// secret are present.
    pub async fn read(&self, provider: Provider) -> Result<StagedCredentials> {
        let client_id = self.store.get(&client_id_key(provider)).await?;
        let client_secret = self.store.get(&client_secret_key(provider)).await?;
        match (client_id, client_secret) {
            (Some(client_id), Some(secret)) if !client_id.is_empty() => Ok(StagedCredentials {
                client_id,
                client_secret: SecretString::from(secret),
            }),
            _ => Err(StowageError::CredentialsNotFound(provider)),
        }
    }

    /// Returns `true` if credentials are currently staged for `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn is_staged(&self, provider: Provider) -> Result<bool> {
        Ok(self.store.get(&client_id_key(provider)).await?.is_some())
    }

    /// Leave a completed token for the opener of `provider`'s attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn deposit_token(&self, provider: Provider, token: &SecretString) -> Result<()> {
        self.store
            .set(&token_key(provider), token.expose_secret())
            .await
    }

    /// Claim a deposited token, removing it from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn take_token(&self, provider: Provider) -> Result<Option<SecretString>> {
        Ok(self
            .store
            .take(&token_key(provider))
            .await?
            .map(SecretString::from))
    }

    /// Remove every staged entry for `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store delete fails.
    pub async fn clear(&self, provider: Provider) -> Result<()> {
        self.store.remove(&client_id_key(provider)).await?;
        self.store.remove(&client_secret_key(provider)).await?;
        self.store.remove(&token_key(provider)).await
    }
}
