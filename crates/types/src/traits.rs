//! Async collaborator traits shared across all stowage crates.
//!
//! Every cross-crate abstraction is defined here so that higher layers depend
//! only on `stowage-types`, not on each other.

use crate::{ExchangeRequest, ExchangeResponse};
use async_trait::async_trait;

pub use crate::error::Result;

/// A string key-value area reachable from every context taking part in an
/// authorization (the opener and the callback page).
///
/// Writers always overwrite the whole value; there is no merge.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
    /// Remove `key` and return what it held.
    async fn take(&self, key: &str) -> Result<Option<String>> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.remove(key).await?;
        }
        Ok(value)
    }
}

/// The backend endpoint that trades an authorization code for an access token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Perform the exchange.
    ///
    /// Transport failures and non-success statuses are errors; a successful
    /// response without a token is returned as-is for the caller to classify.
    async fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse>;
}
