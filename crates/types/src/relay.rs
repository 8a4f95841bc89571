//! Cross-context relay payloads.
//!
//! A [`RelayMessage`] carries the outcome of an authorization from the
//! callback context back to the opener. On the wire it is a JSON object:
//!
//! ```json
//! {"type":"stowage:oauth-relay","success":true,"accessToken":"...","provider":"dropbox"}
//! ```

use crate::Provider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Discriminator identifying a broker relay message.
pub const RELAY_MESSAGE_TYPE: &str = "stowage:oauth-relay";

/// Outcome of one authorization attempt as relayed to the opener.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub provider: Provider,
}

impl RelayMessage {
    /// A successful outcome carrying the access token.
    pub fn success(provider: Provider, access_token: impl Into<String>) -> Self {
        Self {
            kind: RELAY_MESSAGE_TYPE.to_string(),
            success: true,
            access_token: Some(access_token.into()),
            error: None,
            provider,
        }
    }

    /// A failed outcome carrying a human-readable error.
    pub fn failure(provider: Provider, error: impl Into<String>) -> Self {
        Self {
            kind: RELAY_MESSAGE_TYPE.to_string(),
            success: false,
            access_token: None,
            error: Some(error.into()),
            provider,
        }
    }

    /// Interpret an arbitrary message payload as a relay message.
    ///
    /// Returns `None` unless the payload has the relay shape: the fixed
    /// discriminator, an access token iff `success`, an error iff not.
    #[must_use]
    pub fn parse(data: &Value) -> Option<Self> {
        let msg: Self = serde_json::from_value(data.clone()).ok()?;
        if msg.kind != RELAY_MESSAGE_TYPE {
            return None;
        }
        let well_formed = if msg.success {
            msg.access_token.as_deref().is_some_and(|t| !t.is_empty()) && msg.error.is_none()
        } else {
            msg.access_token.is_none() && msg.error.is_some()
        };
        well_formed.then_some(msg)
    }

    /// Serialize into the JSON payload posted across contexts.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Debug for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMessage")
            .field("kind", &self.kind)
            .field("success", &self.success)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("error", &self.error)
            .field("provider", &self.provider)
            .finish()
    }
}

/// A message as delivered to a context's message listener.
///
/// `origin` is the transport-level origin of the sender, never taken from the
/// payload itself.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub origin: String,
    pub data: Value,
}
