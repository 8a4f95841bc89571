//! Popup lifecycle controller.
//!
//! A [`Broker`] starts authorization attempts. Each attempt is a
//! [`PendingAttempt`] that owns everything it installed (the relay listener,
//! the popup window, its staged entries) and releases all of it on every exit
//! path. The one authoritative terminal transition is the [`AttemptOutcome`]
//! returned by [`PendingAttempt::resolve`] (or [`PendingAttempt::complete_with`]
//! for in-process delivery).

use crate::{
    authorize::build_auth_url,
    callback::{CallbackHandler, CallbackParams},
    popup::{PopupFeatures, PopupOpener, PopupWindow},
    redirect::RedirectPolicy,
    relay::{MessageBus, RelayListener},
    staging::CredentialStaging,
    state::StateTokens,
};
use bon::Builder;
use secrecy::SecretString;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use stowage_config::Config;
use stowage_types::{
    AttemptStatus, KeyValueStore, MessageEvent, Provider, RelayMessage, StowageError,
    TokenExchange, traits::Result,
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    time::{Instant, MissedTickBehavior},
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

pub type SuccessHook = Box<dyn FnOnce(&SecretString) + Send>;
pub type ErrorHook = Box<dyn FnOnce(&StowageError) + Send>;

/// Arguments of [`Broker::start`].
#[derive(Builder)]
pub struct StartOptions {
    provider: Provider,
    #[builder(into)]
    client_id: String,
    client_secret: SecretString,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

/// Why an attempt ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The popup was closed before a result arrived.
    Cancelled,
    /// A newer attempt for the same provider took over.
    Superseded,
}

impl AbandonReason {
    #[must_use]
    pub fn error(self) -> StowageError {
        match self {
            Self::Cancelled => StowageError::Cancelled,
            Self::Superseded => StowageError::Superseded,
        }
    }
}

/// Terminal result of one attempt.
pub enum AttemptOutcome {
    Succeeded {
        provider: Provider,
        access_token: SecretString,
    },
    Failed {
        provider: Provider,
        error: StowageError,
    },
    Abandoned {
        provider: Provider,
        reason: AbandonReason,
    },
}

impl AttemptOutcome {
    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        match self {
            Self::Succeeded { .. } => AttemptStatus::Succeeded,
            Self::Failed { .. } => AttemptStatus::Failed,
            Self::Abandoned { .. } => AttemptStatus::Abandoned,
        }
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        match self {
            Self::Succeeded { provider, .. }
            | Self::Failed { provider, .. }
            | Self::Abandoned { provider, .. } => *provider,
        }
    }

    /// The access token, or the error describing why there is none.
    ///
    /// # Errors
    ///
    /// Returns the failure, or [`StowageError::Cancelled`] /
    /// [`StowageError::Superseded`] for abandoned attempts.
    pub fn into_result(self) -> Result<SecretString> {
        match self {
            Self::Succeeded { access_token, .. } => Ok(access_token),
            Self::Failed { error, .. } => Err(error),
            Self::Abandoned { reason, .. } => Err(reason.error()),
        }
    }
}

impl fmt::Debug for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { provider, .. } => f
                .debug_struct("Succeeded")
                .field("provider", provider)
                .field("access_token", &"[REDACTED]")
                .finish(),
            Self::Failed { provider, error } => f
                .debug_struct("Failed")
                .field("provider", provider)
                .field("error", error)
                .finish(),
            Self::Abandoned { provider, reason } => f
                .debug_struct("Abandoned")
                .field("provider", provider)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Starts and supervises authorization attempts for one opener context.
#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn KeyValueStore>,
    tokens: StateTokens,
    staging: CredentialStaging,
    popups: Arc<dyn PopupOpener>,
    exchange: Arc<dyn TokenExchange>,
    bus: MessageBus,
    origin: String,
    policy: RedirectPolicy,
    poll_interval: Duration,
    timeout: Option<Duration>,
    features: PopupFeatures,
    generations: Arc<Mutex<HashMap<Provider, u64>>>,
}

impl Broker {
    /// `origin` is the origin the opener is served from.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        popups: Arc<dyn PopupOpener>,
        exchange: Arc<dyn TokenExchange>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            tokens: StateTokens::new(Arc::clone(&store)),
            staging: CredentialStaging::new(Arc::clone(&store)),
            store,
            popups,
            exchange,
            bus: MessageBus::new(),
            origin: origin.into(),
            policy: RedirectPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_TIMEOUT),
            features: PopupFeatures::default(),
            generations: Arc::default(),
        }
    }

    /// A broker tuned from `config`.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        popups: Arc<dyn PopupOpener>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        Self::new(store, popups, exchange, config.origin.clone())
            .with_policy(RedirectPolicy::new(config.redirects.clone()))
            .with_poll_interval(config.poll_interval())
            .with_timeout(config.timeout())
            .with_popup_features(config.popup.into())
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RedirectPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// `None` waits until the popup closes.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_popup_features(mut self, features: PopupFeatures) -> Self {
        self.features = features;
        self
    }

    /// The opener's message target. Callback contexts post relays here.
    #[must_use]
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// A callback handler sharing this broker's store, backend and policy.
    #[must_use]
    pub fn handler(&self) -> CallbackHandler {
        CallbackHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.exchange),
            self.policy.clone(),
            self.origin.clone(),
        )
    }

    /// Start an attempt: compute the redirect URI, issue state, stage the
    /// credentials and install the relay listener.
    ///
    /// Any attempt already pending for the same provider is superseded.
    ///
    /// # Errors
    ///
    /// Returns an error (after reporting it to `on_error`) if the staging
    /// store cannot be written.
    pub async fn start(&self, options: StartOptions) -> Result<PendingAttempt> {
        let StartOptions {
            provider,
            client_id,
            client_secret,
            on_success,
            on_error,
        } = options;

        let generation = self.next_generation(provider);
        let redirect_uri = self.policy.redirect_uri(provider, &self.origin);

        let staged = async {
            let state = self.tokens.issue(provider).await?;
            self.staging
                .stage(provider, &client_id, &client_secret)
                .await?;
            Ok::<_, StowageError>(state)
        }
        .await;
        let state = match staged {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(%provider, error = %e, "failed to stage authorization attempt");
                let _ = self.tokens.invalidate(provider).await;
                let _ = self.staging.clear(provider).await;
                if let Some(hook) = on_error {
                    hook(&e);
                }
                return Err(e);
            }
        };

        let rx = self.bus.subscribe();
        let (failure_tx, failure_rx) = mpsc::channel(1);
        tracing::info!(%provider, %redirect_uri, "authorization attempt started");

        Ok(PendingAttempt {
            broker: self.clone(),
            listener: RelayListener::new(self.origin.clone(), provider),
            provider,
            state,
            redirect_uri,
            client_id,
            generation,
            status: AttemptStatus::Pending,
            rx: Some(rx),
            failure_tx,
            failure_rx: Some(failure_rx),
            popup: None,
            on_success,
            on_error,
            finished: None,
            torn_down: false,
        })
    }

    /// Whether an attempt for `provider` is waiting for its callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn is_pending(&self, provider: Provider) -> Result<bool> {
        Ok(self.tokens.peek(provider).await?.is_some())
    }

    /// Drop whatever is staged for `provider`. A callback for the discarded
    /// attempt then fails state validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn discard(&self, provider: Provider) -> Result<()> {
        self.next_generation(provider);
        self.tokens.invalidate(provider).await?;
        self.staging.clear(provider).await
    }

    fn next_generation(&self, provider: Provider) -> u64 {
        let mut generations = self.generations.lock().unwrap();
        let generation = generations.entry(provider).or_insert(0);
        *generation += 1;
        *generation
    }

    fn generation(&self, provider: Provider) -> u64 {
        self.generations
            .lock()
            .unwrap()
            .get(&provider)
            .copied()
            .unwrap_or(0)
    }
}

/// One in-flight authorization.
pub struct PendingAttempt {
    broker: Broker,
    provider: Provider,
    state: String,
    redirect_uri: String,
    client_id: String,
    generation: u64,
    status: AttemptStatus,
    rx: Option<broadcast::Receiver<MessageEvent>>,
    failure_tx: mpsc::Sender<StowageError>,
    failure_rx: Option<mpsc::Receiver<StowageError>>,
    listener: RelayListener,
    popup: Option<Arc<dyn PopupWindow>>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
    finished: Option<AttemptOutcome>,
    torn_down: bool,
}

impl PendingAttempt {
    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    /// A handle for ending this attempt with a failure observed elsewhere,
    /// such as a rejected manual completion.
    #[must_use]
    pub fn failure_reporter(&self) -> FailureReporter {
        FailureReporter {
            tx: self.failure_tx.clone(),
        }
    }

    /// The provider consent URL for this attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be encoded.
    pub fn authorization_url(&self) -> Result<String> {
        build_auth_url(self.provider, &self.client_id, &self.redirect_uri, &self.state)
    }

    /// Open `auth_url` in a detached window.
    ///
    /// # Errors
    ///
    /// A refused window ends the attempt on the spot: the error hook fires,
    /// staged entries are cleared and [`StowageError::PopupBlocked`] is
    /// returned. [`resolve`](Self::resolve) then returns the same failure.
    pub async fn open_auth_window(&mut self, auth_url: &str) -> Result<()> {
        if self.finished.is_some() || self.torn_down {
            tracing::debug!(provider = %self.provider, "attempt already finished");
            return Ok(());
        }
        if let Some(previous) = self.popup.take() {
            previous.close();
        }
        if let Some(window) = self.broker.popups.open(auth_url, self.broker.features) {
            self.popup = Some(window);
            return Ok(());
        }

        tracing::warn!(provider = %self.provider, "popup blocked");
        let outcome = self
            .finish(AttemptOutcome::Failed {
                provider: self.provider,
                error: StowageError::PopupBlocked,
            })
            .await;
        self.finished = Some(outcome);
        Err(StowageError::PopupBlocked)
    }

    /// Wait for the terminal outcome, tear down, fire at most one hook.
    ///
    /// Ends on the first of: a relay accepted by the listener, a token left
    /// in the staging store, the popup found closed on a poll tick, the
    /// attempt being superseded, or the wait timing out.
    pub async fn resolve(mut self) -> AttemptOutcome {
        if let Some(outcome) = self.finished.take() {
            return outcome;
        }
        let outcome = self.supervise().await;
        self.finish(outcome).await
    }

    /// Complete with an authorization response delivered in-process (the
    /// provider handed `code` and `state` straight back to the opener), or
    /// with a callback URL the user pasted.
    pub async fn complete_with(mut self, response: &str) -> AttemptOutcome {
        if let Some(outcome) = self.finished.take() {
            return outcome;
        }
        let provider = self.provider;
        let outcome = if self.is_superseded() {
            AttemptOutcome::Abandoned {
                provider,
                reason: AbandonReason::Superseded,
            }
        } else {
            let exchanged = match CallbackParams::parse(response) {
                Ok(params) => self.broker.handler().exchange(provider, &params).await,
                Err(e) => Err(e),
            };
            match exchanged {
                Ok(access_token) => AttemptOutcome::Succeeded {
                    provider,
                    access_token,
                },
                Err(error) => AttemptOutcome::Failed { provider, error },
            }
        };
        self.finish(outcome).await
    }

    /// Abandon the attempt without reporting to the hooks. Idempotent.
    pub async fn stop(&mut self) {
        if self.finished.is_some() || self.torn_down {
            return;
        }
        self.teardown().await;
        self.status = AttemptStatus::Abandoned;
        self.on_success = None;
        self.on_error = None;
        self.finished = Some(AttemptOutcome::Abandoned {
            provider: self.provider,
            reason: AbandonReason::Cancelled,
        });
    }

    async fn supervise(&mut self) -> AttemptOutcome {
        let provider = self.provider;
        let abandoned = |reason| AttemptOutcome::Abandoned { provider, reason };
        let Some(mut rx) = self.rx.take() else {
            return abandoned(AbandonReason::Cancelled);
        };

        let period = self.broker.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = self.broker.timeout.map(|t| Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut failures = self.failure_rx.take();
        let mut listening = true;
        loop {
            tokio::select! {
                biased;

                event = rx.recv(), if listening => match event {
                    Ok(event) => {
                        if self.is_superseded() {
                            return abandoned(AbandonReason::Superseded);
                        }
                        if let Some(msg) = self.listener.accept(&event) {
                            return outcome_from_relay(msg);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(%provider, skipped, "relay listener lagged");
                    }
                    Err(RecvError::Closed) => listening = false,
                },

                Some(error) = recv_failure(&mut failures) => {
                    return AttemptOutcome::Failed { provider, error };
                }

                _ = ticker.tick() => {
                    if self.is_superseded() {
                        return abandoned(AbandonReason::Superseded);
                    }
                    match self.broker.staging.take_token(provider).await {
                        Ok(Some(access_token)) => {
                            return AttemptOutcome::Succeeded { provider, access_token };
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(%provider, error = %e, "failed to poll staged token"),
                    }
                    if self.popup.as_ref().is_some_and(|p| p.is_closed()) {
                        return abandoned(AbandonReason::Cancelled);
                    }
                }

                () = &mut expired => {
                    return AttemptOutcome::Failed { provider, error: StowageError::TimedOut };
                }
            }
        }
    }

    async fn finish(&mut self, outcome: AttemptOutcome) -> AttemptOutcome {
        self.teardown().await;
        self.status = outcome.status();

        let on_success = self.on_success.take();
        let on_error = self.on_error.take();
        match &outcome {
            AttemptOutcome::Succeeded { access_token, .. } => {
                tracing::info!(provider = %self.provider, "authorization succeeded");
                if let Some(hook) = on_success {
                    hook(access_token);
                }
            }
            AttemptOutcome::Failed { error, .. } => {
                tracing::info!(provider = %self.provider, error = %error, "authorization failed");
                if let Some(hook) = on_error {
                    hook(error);
                }
            }
            AttemptOutcome::Abandoned { reason, .. } => {
                tracing::info!(provider = %self.provider, ?reason, "authorization abandoned");
                if let Some(hook) = on_error {
                    hook(&reason.error());
                }
            }
        }
        outcome
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.release();

        // a newer attempt owns the staged entries now
        if self.is_superseded() {
            return;
        }
        if let Err(e) = self.broker.tokens.invalidate(self.provider).await {
            tracing::warn!(provider = %self.provider, error = %e, "failed to clear staged state");
        }
        if let Err(e) = self.broker.staging.clear(self.provider).await {
            tracing::warn!(provider = %self.provider, error = %e, "failed to clear staged credentials");
        }
    }

    /// Remove the listener and close the popup if it is still open.
    fn release(&mut self) {
        self.rx = None;
        if let Some(popup) = self.popup.take() {
            if !popup.is_closed() {
                popup.close();
            }
        }
    }

    fn is_superseded(&self) -> bool {
        self.broker.generation(self.provider) != self.generation
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        if !self.torn_down {
            tracing::debug!(provider = %self.provider, "pending attempt dropped before resolving");
        }
        self.release();
    }
}

/// Ends a [`PendingAttempt`] from another task. Only the first report counts.
#[derive(Clone)]
pub struct FailureReporter {
    tx: mpsc::Sender<StowageError>,
}

impl FailureReporter {
    /// Fail the attempt with `error`. A no-op once the attempt has ended or
    /// another failure is already queued.
    pub fn report(&self, error: StowageError) {
        if let Err(e) = self.tx.try_send(error) {
            tracing::debug!(error = %e, "failure report dropped");
        }
    }
}

async fn recv_failure(
    failures: &mut Option<mpsc::Receiver<StowageError>>,
) -> Option<StowageError> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn outcome_from_relay(msg: RelayMessage) -> AttemptOutcome {
    let provider = msg.provider;
    match (msg.success, msg.access_token, msg.error) {
        (true, Some(token), _) => AttemptOutcome::Succeeded {
            provider,
            access_token: SecretString::from(token),
        },
        (_, _, error) => AttemptOutcome::Failed {
            provider,
            error: StowageError::Relayed(error.unwrap_or_default()),
        },
    }
}
