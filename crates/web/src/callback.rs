//! Callback page and manual completion handlers.

use axum::{
    Json,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Uri, header},
    response::Html,
};
use secrecy::ExposeSecret as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stowage_types::Provider;
use url::Url;

use crate::{AppState, error::ApiError, page};

/// Handles `GET /oauth/{provider}/callback`, the page the provider redirects
/// the popup to.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Html<String>, ApiError> {
    let provider: Provider = provider.parse()?;
    let handler = state.handler();

    let page_origin = handler.policy().callback_origin(provider, handler.origin());
    let callback_url = received_url(&page_origin, &headers, &uri);

    let report = handler
        .handle(provider, &callback_url, state.opener.as_deref())
        .await;
    tracing::debug!(%provider, delivery = ?report.delivery, success = report.is_success(), "callback handled");
    Ok(Html(page::render(&report)))
}

/// The callback URL as the browser requested it: the request target's
/// authority or the `Host` header, under the page's scheme. Falls back to the
/// configured page origin when the request names no host.
fn received_url(page_origin: &str, headers: &HeaderMap, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    let host = uri
        .authority()
        .map(|a| a.as_str())
        .or_else(|| headers.get(header::HOST).and_then(|h| h.to_str().ok()));
    let Some(host) = host else {
        return format!("{}{path_and_query}", page_origin.trim_end_matches('/'));
    };
    let page = Url::parse(page_origin).ok();
    let scheme = uri
        .scheme_str()
        .or_else(|| page.as_ref().map(Url::scheme))
        .unwrap_or("http");
    format!("{scheme}://{host}{path_and_query}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub callback_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub provider: Provider,
    pub access_token: String,
}

/// Handles `POST /oauth/{provider}/complete`: the main window submits the
/// callback URL the user pasted.
pub async fn complete(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let provider: Provider = provider.parse()?;
    let token = state
        .handler()
        .complete_manually(provider, &body.callback_url)
        .await?;
    Ok(Json(CompleteResponse {
        provider,
        access_token: token.expose_secret().to_string(),
    }))
}
