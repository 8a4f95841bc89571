//! API error type that maps [`StowageError`] variants to HTTP status codes.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use stowage_types::StowageError;

/// Wrapper around [`StowageError`] that implements [`IntoResponse`].
pub struct ApiError(pub StowageError);

impl ApiError {
    /// Returns `(status, error_type)` for the wrapped error.
    fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            StowageError::UnknownProvider(_) => (StatusCode::NOT_FOUND, "not_found_error"),
            StowageError::NoCode | StowageError::ProviderDenied(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            StowageError::InvalidState => (StatusCode::FORBIDDEN, "security_error"),
            StowageError::CredentialsNotFound(_) => (StatusCode::CONFLICT, "authorization_error"),
            StowageError::Exchange(_) | StowageError::NoAccessToken | StowageError::Http(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (
            status,
            Json(json!({
                "error": {
                    "message": self.0.to_string(),
                    "type": error_type,
                    "code": self.0.code(),
                }
            })),
        )
            .into_response()
    }
}

impl From<StowageError> for ApiError {
    fn from(e: StowageError) -> Self {
        Self(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt as _;
    use stowage_types::Provider;

    async fn extract_error_body(err: ApiError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_invalid_state_is_forbidden() {
        let (status, body) = extract_error_body(ApiError(StowageError::InvalidState)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["type"], "security_error");
        assert_eq!(body["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_credentials_not_found_is_conflict() {
        let (status, body) = extract_error_body(ApiError(StowageError::CredentialsNotFound(
            Provider::Dropbox,
        )))
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "credentials_not_found");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("restart the flow")
        );
    }

    #[tokio::test]
    async fn test_no_code_is_bad_request() {
        let (status, body) = extract_error_body(ApiError(StowageError::NoCode)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "no authorization code");
    }

    #[tokio::test]
    async fn test_exchange_failure_is_bad_gateway() {
        let (status, body) =
            extract_error_body(ApiError(StowageError::Exchange("boom".into()))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "upstream_error");
        assert_eq!(body["error"]["code"], "exchange_error");
    }

    #[tokio::test]
    async fn test_unknown_provider_is_not_found() {
        let (status, _) =
            extract_error_body(ApiError(StowageError::UnknownProvider("box".into()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_internal_error() {
        let (status, body) =
            extract_error_body(ApiError(StowageError::Storage("disk full".into()))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "server_error");
    }
}
