//! Third-party storage authorization broker.
//!
//! Sub-modules follow the life of one attempt: [`state`] and [`staging`] hold
//! what must survive the trip through the provider, [`redirect`] and
//! [`authorize`] build the consent URL, [`popup`] and [`relay`] connect the
//! opener to the callback context, and [`callback`] turns the provider's
//! answer into a token via [`exchange`]. The [`Broker`] ties them together.

pub mod authorize;
pub mod broker;
pub mod callback;
pub mod exchange;
pub mod popup;
pub mod redirect;
pub mod relay;
pub mod staging;
pub mod state;

#[cfg(test)]
mod testing;

pub use broker::{
    AbandonReason, AttemptOutcome, Broker, FailureReporter, PendingAttempt, StartOptions,
};
pub use callback::{CallbackHandler, CallbackParams, CallbackReport, CallbackState, Delivery};
pub use exchange::HttpTokenExchange;
pub use popup::{PopupFeatures, PopupOpener, PopupWindow, SystemBrowser};
pub use redirect::RedirectPolicy;
pub use relay::{BusOpener, MessageBus, OpenerHandle, RelayListener};
pub use staging::CredentialStaging;
pub use state::StateTokens;
