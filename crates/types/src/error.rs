//! Unified error type for the stowage workspace.

use thiserror::Error;

/// Enumerates all error kinds that can occur across stowage crates.
///
/// The first group mirrors the broker's failure taxonomy; every one of them is
/// terminal for the current authorization attempt.
#[derive(Debug, Error)]
pub enum StowageError {
    /// The provider redirected back without a `code` parameter.
    #[error("no authorization code")]
    NoCode,

    /// The `state` parameter did not match the one issued for this attempt.
    #[error("authorization rejected: possible CSRF (invalid state parameter)")]
    InvalidState,

    /// Staged client credentials are missing for the provider.
    #[error("credentials not found for {0}, restart the flow")]
    CredentialsNotFound(crate::Provider),

    /// The popup window could not be opened.
    #[error("popup blocked")]
    PopupBlocked,

    /// The user closed the popup before a result arrived.
    #[error("authorization cancelled")]
    Cancelled,

    /// No result arrived within the configured wait.
    #[error("timed out waiting for authorization")]
    TimedOut,

    /// A newer attempt for the same provider replaced this one.
    #[error("authorization superseded by a newer attempt")]
    Superseded,

    /// The provider itself reported an error (`error=` in the callback).
    #[error("provider denied authorization: {0}")]
    ProviderDenied(String),

    /// The backend token exchange failed.
    #[error("token exchange failed: {0}")]
    Exchange(String),

    /// The backend answered without an access token.
    #[error("no access token received")]
    NoAccessToken,

    /// Failure reported by the callback context, carried verbatim.
    #[error("{0}")]
    Relayed(String),

    /// The provider name is not recognised.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Staging store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),
}

// ── Feature-gated From impls ──────────────────────────────────────────────────

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for StowageError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for StowageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl StowageError {
    /// Returns `true` for failures that indicate a forged or replayed callback.
    ///
    /// These must never be answered with "retry with the same state".
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::InvalidState)
    }

    /// Returns `true` if the error is likely transient and worth retrying.
    ///
    /// Broker failures never are: the caller restarts the whole flow with a
    /// fresh state and freshly staged credentials.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Storage(_))
    }

    /// Short machine-readable classification, used in relay payloads and HTTP
    /// error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoCode => "no_code",
            Self::InvalidState => "invalid_state",
            Self::CredentialsNotFound(_) => "credentials_not_found",
            Self::PopupBlocked => "popup_blocked",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Superseded => "superseded",
            Self::ProviderDenied(_) => "provider_denied",
            Self::Exchange(_) => "exchange_error",
            Self::NoAccessToken => "no_access_token",
            Self::Relayed(_) => "relayed_error",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Http(_) => "http_error",
            Self::Serialization(_) => "serialization_error",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "config_error",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StowageError>;
