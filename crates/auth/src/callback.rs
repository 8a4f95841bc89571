//! Callback exchange handler.
//!
//! Runs where the provider redirects to. Its one job is to turn a callback
//! URL into a terminal outcome:
//!
//! 1. parse `code` and `state` (provider `error=` responses fail first);
//! 2. validate the state against the staged one (one-time, always consumed);
//! 3. read the staged client credentials;
//! 4. call the backend exchange with the redirect URI echo;
//! 5. require an access token in the answer.
//!
//! Whatever happens, staged material for the provider is cleared afterwards.
//!
//! [`CallbackHandler::handle`] is the entry point for the callback page; it
//! relays the outcome to a trusted opener or, when there is none, leaves the
//! code unspent and hands off to the manual path, where the main context runs
//! the same steps through [`CallbackHandler::complete_manually`].

use crate::{
    redirect::RedirectPolicy,
    relay::OpenerHandle,
    staging::CredentialStaging,
    state::StateTokens,
};
use secrecy::{ExposeSecret as _, SecretString};
use std::sync::Arc;
use stowage_types::{
    ExchangeRequest, KeyValueStore, Provider, RelayMessage, StowageError, TokenExchange,
    traits::Result,
};
use url::Url;

/// Query parameters of an authorization response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a full callback URL, a path with query, or a bare query string.
    /// The first occurrence of a repeated parameter wins.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::NoCode`] if the input cannot be parsed as a URL.
    pub fn parse(input: &str) -> Result<Self> {
        let url = parse_callback_url(input.trim()).map_err(|e| {
            tracing::debug!(error = %e, "malformed callback url");
            StowageError::NoCode
        })?;

        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.into_owned());
        }
        Ok(params)
    }

    fn code(&self) -> Option<&str> {
        self.code.as_deref().filter(|c| !c.is_empty())
    }
}

/// Resolve relative input (a path, or a bare `code=…&state=…` query) against
/// a placeholder base so that every form goes through the same URL parser.
fn parse_callback_url(input: &str) -> std::result::Result<Url, url::ParseError> {
    match Url::parse(input) {
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse("http://callback.invalid/")?;
            if input.starts_with('/') || input.starts_with('?') {
                base.join(input)
            } else {
                base.join(&format!("?{input}"))
            }
        }
        parsed => parsed,
    }
}

/// Terminal state of the callback page.
#[derive(Debug)]
pub enum CallbackState {
    Succeeded,
    Failed(StowageError),
    /// No trusted opener: the code was left unspent for manual transfer.
    HandedOff,
}

/// How the outcome left the callback context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Posted to the opener as a relay message.
    Relayed,
    /// Shown to the user for copy/paste into the main window.
    Manual,
}

/// Everything the callback page needs to render.
#[derive(Debug)]
pub struct CallbackReport {
    pub provider: Provider,
    /// The callback URL exactly as received.
    pub callback_url: String,
    pub state: CallbackState,
    pub delivery: Delivery,
}

impl CallbackReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.state, CallbackState::Succeeded)
    }

    #[must_use]
    pub fn error(&self) -> Option<&StowageError> {
        match &self.state {
            CallbackState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Completes authorizations from callback URLs.
#[derive(Clone)]
pub struct CallbackHandler {
    tokens: StateTokens,
    staging: CredentialStaging,
    exchange: Arc<dyn TokenExchange>,
    policy: RedirectPolicy,
    origin: String,
}

impl CallbackHandler {
    /// `origin` is the origin the app is served from.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        exchange: Arc<dyn TokenExchange>,
        policy: RedirectPolicy,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            tokens: StateTokens::new(Arc::clone(&store)),
            staging: CredentialStaging::new(store),
            exchange,
            policy,
            origin: origin.into(),
        }
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn policy(&self) -> &RedirectPolicy {
        &self.policy
    }

    /// Run steps 1–5 for `provider`. Terminal for the attempt: staged state
    /// and credentials are cleared whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; see the module docs for the order.
    pub async fn exchange(&self, provider: Provider, params: &CallbackParams) -> Result<SecretString> {
        let result = self.run(provider, params).await;

        if let Err(e) = self.tokens.invalidate(provider).await {
            tracing::warn!(%provider, error = %e, "failed to clear staged state");
        }
        if let Err(e) = self.staging.clear(provider).await {
            tracing::warn!(%provider, error = %e, "failed to clear staged credentials");
        }

        match &result {
            Ok(_) => tracing::info!(%provider, "authorization code exchanged"),
            Err(e) if e.is_security_event() => {
                tracing::warn!(%provider, "callback state rejected, possible CSRF");
            }
            Err(e) => tracing::info!(%provider, error = %e, "authorization failed"),
        }
        result
    }

    async fn run(&self, provider: Provider, params: &CallbackParams) -> Result<SecretString> {
        if let Some(error) = &params.error {
            let detail = params.error_description.as_ref().unwrap_or(error);
            return Err(StowageError::ProviderDenied(detail.clone()));
        }
        let code = params.code().ok_or(StowageError::NoCode)?;

        if !self.tokens.validate(provider, params.state.as_deref()).await? {
            return Err(StowageError::InvalidState);
        }

        let creds = self.staging.read(provider).await?;
        let request = ExchangeRequest {
            code: code.to_string(),
            provider,
            redirect_uri: self.policy.redirect_uri(provider, &self.origin),
            client_id: creds.client_id,
            client_secret: creds.client_secret,
        };

        let response = self.exchange.exchange(&request).await.map_err(|e| match e {
            StowageError::Exchange(_) => e,
            other => StowageError::Exchange(other.to_string()),
        })?;

        response
            .access_token
            .filter(|t| !t.is_empty())
            .map(SecretString::from)
            .ok_or(StowageError::NoAccessToken)
    }

    /// Entry point of the callback page.
    ///
    /// With an opener that is reachable and served from the callback page's
    /// own origin, the exchange runs here and the outcome is relayed. Otherwise
    /// the callback is handed off untouched for manual transfer; only outcomes
    /// that are already certain (provider error, missing code) end the attempt
    /// here.
    pub async fn handle(
        &self,
        provider: Provider,
        callback_url: &str,
        opener: Option<&dyn OpenerHandle>,
    ) -> CallbackReport {
        let page_origin = self.policy.callback_origin(provider, &self.origin);
        let params = CallbackParams::parse(callback_url).unwrap_or_default();
        let trusted = opener.filter(|o| o.is_reachable() && o.shares_origin(&page_origin));

        let Some(opener) = trusted else {
            tracing::info!(%provider, "no trusted opener, handing off for manual transfer");
            return self.hand_off(provider, callback_url, &params).await;
        };

        let state = match self.exchange(provider, &params).await {
            Ok(token) => {
                let msg = RelayMessage::success(provider, token.expose_secret());
                opener.post_message(&msg, &page_origin, &page_origin);
                CallbackState::Succeeded
            }
            Err(e) => {
                let msg = RelayMessage::failure(provider, e.to_string());
                opener.post_message(&msg, &page_origin, &page_origin);
                CallbackState::Failed(e)
            }
        };
        CallbackReport {
            provider,
            callback_url: callback_url.to_string(),
            state,
            delivery: Delivery::Relayed,
        }
    }

    async fn hand_off(
        &self,
        provider: Provider,
        callback_url: &str,
        params: &CallbackParams,
    ) -> CallbackReport {
        let early = if params.error.is_some() || params.code().is_none() {
            // certain failure: no point transferring it, end the attempt here
            Some(self.exchange(provider, params).await)
        } else {
            None
        };
        let state = match early {
            Some(Err(e)) => CallbackState::Failed(e),
            Some(Ok(_)) | None => CallbackState::HandedOff,
        };
        CallbackReport {
            provider,
            callback_url: callback_url.to_string(),
            state,
            delivery: Delivery::Manual,
        }
    }

    /// Manual fallback in the main context: run steps 1–5 on a pasted callback
    /// URL. If an attempt for `provider` is waiting, the token is also left in
    /// the staging store for its opener to claim.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the exchange.
    pub async fn complete_manually(&self, provider: Provider, pasted: &str) -> Result<SecretString> {
        let params = CallbackParams::parse(pasted)?;
        let waiting = self.tokens.peek(provider).await?.is_some();
        let token = self.exchange(provider, &params).await?;
        if waiting {
            self.staging.deposit_token(provider, &token).await?;
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{BusOpener, MessageBus};
    use crate::testing::{RecordingExchange, Reply};
    use stowage_store::MemoryStore;

    const ORIGIN: &str = "http://localhost:3000";

    struct Fixture {
        store: Arc<MemoryStore>,
        exchange: Arc<RecordingExchange>,
        handler: CallbackHandler,
    }

    fn fixture(reply: Reply, origin: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let exchange = RecordingExchange::new(reply);
        let handler = CallbackHandler::new(
            store.clone(),
            exchange.clone(),
            RedirectPolicy::default(),
            origin,
        );
        Fixture {
            store,
            exchange,
            handler,
        }
    }

    async fn stage(f: &Fixture, provider: Provider) -> String {
        CredentialStaging::new(f.store.clone())
            .stage(provider, "cid", &SecretString::from("sec".to_string()))
            .await
            .unwrap();
        StateTokens::new(f.store.clone()).issue(provider).await.unwrap()
    }

    #[test]
    fn test_parse_full_url() {
        let p = CallbackParams::parse(
            "http://localhost:3000/oauth/dropbox/callback?code=abc123&state=dropbox-xyz",
        )
        .unwrap();
        assert_eq!(p.code.as_deref(), Some("abc123"));
        assert_eq!(p.state.as_deref(), Some("dropbox-xyz"));
    }

    #[test]
    fn test_parse_bare_query_and_fragment() {
        let p = CallbackParams::parse("code=a%2Bb&state=s#ignored").unwrap();
        assert_eq!(p.code.as_deref(), Some("a+b"));
        assert_eq!(p.state.as_deref(), Some("s"));
    }

    #[test]
    fn test_parse_provider_error() {
        let p = CallbackParams::parse(
            "/oauth/dropbox/callback?error=access_denied&error_description=The+user+denied",
        )
        .unwrap();
        assert_eq!(p.error.as_deref(), Some("access_denied"));
        assert_eq!(p.error_description.as_deref(), Some("The user denied"));
        assert!(p.code.is_none());
    }

    #[test]
    fn test_parse_first_occurrence_wins() {
        let p = CallbackParams::parse("?code=first&code=second&state=s&unrelated=1").unwrap();
        assert_eq!(p.code.as_deref(), Some("first"));
        assert_eq!(p.state.as_deref(), Some("s"));
    }

    #[test]
    fn test_parse_ignores_fragment_of_full_url() {
        let p = CallbackParams::parse(
            "  https://backup.example.com/oauth/dropbox/callback?code=c&state=s#frag  ",
        )
        .unwrap();
        assert_eq!(p.code.as_deref(), Some("c"));
        assert_eq!(p.state.as_deref(), Some("s"));
    }

    #[test]
    fn test_parse_no_query() {
        assert_eq!(
            CallbackParams::parse("http://localhost:3000/oauth/dropbox/callback").unwrap(),
            CallbackParams::default()
        );
    }

    #[tokio::test]
    async fn test_exchange_success_clears_staging() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let params = CallbackParams {
            code: Some("abc123".into()),
            state: Some(state),
            ..CallbackParams::default()
        };
        let token = f.handler.exchange(Provider::Dropbox, &params).await.unwrap();
        assert_eq!(token.expose_secret(), "tok");

        let calls = f.exchange.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                "abc123".to_string(),
                "http://localhost:3000/oauth/dropbox/callback".to_string(),
                "cid".to_string(),
                "sec".to_string(),
            )]
        );
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_code() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let params = CallbackParams {
            state: Some(state),
            ..CallbackParams::default()
        };
        let err = f.handler.exchange(Provider::Dropbox, &params).await.unwrap_err();
        assert!(matches!(err, StowageError::NoCode));
        assert_eq!(f.exchange.call_count(), 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_state_makes_no_exchange_call() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let _ = stage(&f, Provider::Dropbox).await;
        let params = CallbackParams::parse("code=abc123&state=garbage").unwrap();
        let err = f.handler.exchange(Provider::Dropbox, &params).await.unwrap_err();
        assert!(matches!(err, StowageError::InvalidState));
        assert!(err.is_security_event());
        assert_eq!(f.exchange.call_count(), 0);
        assert!(f.store.is_empty(), "staged state must be cleared");
    }

    #[tokio::test]
    async fn test_credentials_not_found() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = StateTokens::new(f.store.clone())
            .issue(Provider::GoogleDrive)
            .await
            .unwrap();
        let params = CallbackParams {
            code: Some("c".into()),
            state: Some(state),
            ..CallbackParams::default()
        };
        let err = f
            .handler
            .exchange(Provider::GoogleDrive, &params)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StowageError::CredentialsNotFound(Provider::GoogleDrive)
        ));
        assert_eq!(f.exchange.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_access_token_in_response() {
        let f = fixture(Reply::Empty, ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let params = CallbackParams {
            code: Some("c".into()),
            state: Some(state),
            ..CallbackParams::default()
        };
        let err = f.handler.exchange(Provider::Dropbox, &params).await.unwrap_err();
        assert!(matches!(err, StowageError::NoAccessToken));
        assert_eq!(err.to_string(), "no access token received");
    }

    #[tokio::test]
    async fn test_backend_error_is_wrapped() {
        let f = fixture(Reply::Fail("connection refused"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let params = CallbackParams {
            code: Some("c".into()),
            state: Some(state),
            ..CallbackParams::default()
        };
        let err = f.handler.exchange(Provider::Dropbox, &params).await.unwrap_err();
        assert!(matches!(err, StowageError::Exchange(_)));
        assert!(err.to_string().contains("connection refused"));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_provider_denied() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let params = CallbackParams {
            error: Some("access_denied".into()),
            state: Some(state),
            ..CallbackParams::default()
        };
        let err = f.handler.exchange(Provider::Dropbox, &params).await.unwrap_err();
        assert!(matches!(err, StowageError::ProviderDenied(ref d) if d == "access_denied"));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_google_drive_echoes_sentinel_redirect() {
        let f = fixture(Reply::Token("gtok"), "https://backup.example.com");
        let state = stage(&f, Provider::GoogleDrive).await;
        let params = CallbackParams {
            code: Some("g".into()),
            state: Some(state),
            ..CallbackParams::default()
        };
        f.handler
            .exchange(Provider::GoogleDrive, &params)
            .await
            .unwrap();
        assert_eq!(f.exchange.calls.lock().unwrap()[0].1, "postmessage");
    }

    #[tokio::test]
    async fn test_handle_relays_success_to_trusted_opener() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let bus = MessageBus::new();
        let mut rx = bus.subscribe();
        let opener = BusOpener::new(bus.clone(), ORIGIN);

        let url = format!("{ORIGIN}/oauth/dropbox/callback?code=abc123&state={state}");
        let report = f
            .handler
            .handle(Provider::Dropbox, &url, Some(&opener))
            .await;
        assert!(report.is_success());
        assert_eq!(report.delivery, Delivery::Relayed);
        assert_eq!(report.callback_url, url);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.origin, ORIGIN);
        let msg = RelayMessage::parse(&event.data).unwrap();
        assert!(msg.success);
        assert_eq!(msg.access_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_handle_relays_when_registered_url_names_default_port() {
        let store = Arc::new(MemoryStore::new());
        let exchange = RecordingExchange::new(Reply::Token("tok"));
        let policy = RedirectPolicy::new(std::collections::HashMap::from([(
            Provider::Dropbox,
            stowage_config::RedirectSetting::Fixed(
                "https://backup.example.com:443/oauth/dropbox/callback".into(),
            ),
        )]));
        let handler = CallbackHandler::new(
            store.clone(),
            exchange.clone(),
            policy,
            "https://backup.example.com",
        );
        CredentialStaging::new(store.clone())
            .stage(Provider::Dropbox, "cid", &SecretString::from("sec".to_string()))
            .await
            .unwrap();
        let state = StateTokens::new(store.clone())
            .issue(Provider::Dropbox)
            .await
            .unwrap();

        let bus = MessageBus::new();
        let mut rx = bus.subscribe();
        let opener = BusOpener::new(bus.clone(), "https://backup.example.com");
        let url = format!(
            "https://backup.example.com:443/oauth/dropbox/callback?code=abc&state={state}"
        );
        let report = handler.handle(Provider::Dropbox, &url, Some(&opener)).await;

        assert_eq!(report.delivery, Delivery::Relayed);
        assert!(report.is_success());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.origin, "https://backup.example.com");
        assert_eq!(exchange.call_count(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_handle_relays_failure() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let _ = stage(&f, Provider::Dropbox).await;
        let bus = MessageBus::new();
        let mut rx = bus.subscribe();
        let opener = BusOpener::new(bus.clone(), ORIGIN);

        let report = f
            .handler
            .handle(
                Provider::Dropbox,
                "/oauth/dropbox/callback?code=abc&state=garbage",
                Some(&opener),
            )
            .await;
        assert!(matches!(report.error(), Some(StowageError::InvalidState)));
        let msg = RelayMessage::parse(&rx.recv().await.unwrap().data).unwrap();
        assert!(!msg.success);
        assert!(msg.error.unwrap().contains("CSRF"));
        assert_eq!(f.exchange.call_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_without_opener_hands_off_unspent() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let url = format!("{ORIGIN}/oauth/dropbox/callback?code=abc123&state={state}");
        let report = f.handler.handle(Provider::Dropbox, &url, None).await;
        assert!(matches!(report.state, CallbackState::HandedOff));
        assert_eq!(report.delivery, Delivery::Manual);
        assert_eq!(f.exchange.call_count(), 0);
        // state and credentials stay staged for the main window
        assert_eq!(
            StateTokens::new(f.store.clone())
                .peek(Provider::Dropbox)
                .await
                .unwrap(),
            Some(state)
        );
    }

    #[tokio::test]
    async fn test_handle_origin_mismatch_hands_off() {
        // the app is browsed at a deployment origin while Dropbox can only
        // redirect to the fixed localhost callback
        let f = fixture(Reply::Token("tok"), "https://backup.example.com");
        let state = stage(&f, Provider::Dropbox).await;
        let bus = MessageBus::new();
        let mut rx = bus.subscribe();
        let opener = BusOpener::new(bus.clone(), "https://backup.example.com");

        let url = format!("http://localhost:3000/oauth/dropbox/callback?code=c&state={state}");
        let report = f
            .handler
            .handle(Provider::Dropbox, &url, Some(&opener))
            .await;
        assert_eq!(report.delivery, Delivery::Manual);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.exchange.call_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_without_opener_reports_certain_failure() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let _ = stage(&f, Provider::Dropbox).await;
        let report = f
            .handler
            .handle(Provider::Dropbox, "/oauth/dropbox/callback?state=x", None)
            .await;
        assert!(matches!(report.error(), Some(StowageError::NoCode)));
        assert_eq!(report.delivery, Delivery::Manual);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_complete_manually_deposits_for_waiting_opener() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let pasted = format!("http://localhost:3000/oauth/dropbox/callback?code=abc&state={state}");
        let token = f
            .handler
            .complete_manually(Provider::Dropbox, &pasted)
            .await
            .unwrap();
        assert_eq!(token.expose_secret(), "tok");
        let deposited = CredentialStaging::new(f.store.clone())
            .take_token(Provider::Dropbox)
            .await
            .unwrap();
        assert_eq!(deposited.unwrap().expose_secret(), "tok");
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_complete_manually_replay_rejected() {
        let f = fixture(Reply::Token("tok"), ORIGIN);
        let state = stage(&f, Provider::Dropbox).await;
        let pasted = format!("code=abc&state={state}");
        f.handler
            .complete_manually(Provider::Dropbox, &pasted)
            .await
            .unwrap();
        let err = f
            .handler
            .complete_manually(Provider::Dropbox, &pasted)
            .await
            .unwrap_err();
        assert!(matches!(err, StowageError::InvalidState));
        assert_eq!(f.exchange.call_count(), 1);
    }
}
