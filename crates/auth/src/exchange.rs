//! Backend token-exchange client.
//!
//! The backend proxies the provider's token endpoint; the broker only posts
//! `{code, provider, redirectUri, clientId, clientSecret}` and reads back
//! `accessToken`.

use async_trait::async_trait;
use stowage_types::{
    ExchangeRequest, ExchangeResponse, StowageError, TokenExchange, traits::Result,
};

/// [`TokenExchange`] over HTTP.
pub struct HttpTokenExchange {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTokenExchange {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        tracing::debug!(provider = %request.provider, endpoint = %self.endpoint, "exchanging authorization code");
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| StowageError::Exchange(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StowageError::Exchange(format!(
                "backend returned {status}: {}",
                backend_message(&body)
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| StowageError::Exchange(format!("invalid backend response: {e}")))?;
        // any other shape is reported by the caller as "no access token"
        Ok(serde_json::from_value(json).unwrap_or_default())
    }
}

/// Extract a readable message from a backend error body.
fn backend_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .or_else(|| v.get("message"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().chars().take(200).collect())
}
