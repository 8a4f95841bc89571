//! HTTP surface of the broker: the provider callback page and the manual
//! completion endpoint.

mod callback;
mod error;
mod page;

pub use callback::{CompleteRequest, CompleteResponse};
pub use error::ApiError;

use arc_swap::ArcSwap;
use axum::{
    Json, Router,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use stowage_auth::{CallbackHandler, OpenerHandle, RedirectPolicy};
use stowage_config::Config;
use stowage_types::{KeyValueStore, TokenExchange};
use tower_http::trace::TraceLayer;

/// Shared application state passed to all route handlers.
pub struct AppState {
    /// Server configuration. Atomically swappable for hot-reloading.
    pub config: Arc<ArcSwap<Config>>,
    /// Staging store shared with the opener.
    pub store: Arc<dyn KeyValueStore>,
    /// Backend token exchange.
    pub exchange: Arc<dyn TokenExchange>,
    /// The opener waiting in this process, if any.
    pub opener: Option<Arc<dyn OpenerHandle>>,
}

impl AppState {
    pub fn new(
        config: Arc<ArcSwap<Config>>,
        store: Arc<dyn KeyValueStore>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        Self {
            config,
            store,
            exchange,
            opener: None,
        }
    }

    /// Relay callback results to `opener`.
    #[must_use]
    pub fn with_opener(mut self, opener: Arc<dyn OpenerHandle>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// A callback handler for the current configuration snapshot.
    #[must_use]
    pub fn handler(&self) -> CallbackHandler {
        let config = self.config.load();
        CallbackHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.exchange),
            RedirectPolicy::new(config.redirects.clone()),
            config.origin.clone(),
        )
    }
}

/// Build the full axum router.
///
/// Routes:
/// - GET  /oauth/{provider}/callback    provider redirect target
/// - POST /oauth/{provider}/complete    manual completion from a pasted URL
/// - GET  /healthz
pub fn make_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/oauth/{provider}/callback", get(callback::oauth_callback))
        .route("/oauth/{provider}/complete", post(callback::complete))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
