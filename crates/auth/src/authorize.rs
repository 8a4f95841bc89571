//! Provider authorization endpoints and consent-screen URLs.

use stowage_types::{Provider, StowageError, traits::Result};

/// Dropbox OAuth authorization endpoint.
pub const DROPBOX_AUTH_URL: &str = "https://www.dropbox.com/oauth2/authorize";

/// Google OAuth authorization endpoint.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Scope requested for Google Drive: files created or opened by the app only.
pub const GOOGLE_DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Build the consent-screen URL for `provider`.
///
/// # Errors
///
/// Returns an error if the query string cannot be encoded.
pub fn build_auth_url(
    provider: Provider,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> Result<String> {
    let (base, params): (&str, Vec<(&str, &str)>) = match provider {
        Provider::Dropbox => (
            DROPBOX_AUTH_URL,
            vec![
                ("client_id", client_id),
                ("response_type", "code"),
                ("redirect_uri", redirect_uri),
                ("state", state),
                // offline access yields a refresh token for the backend
                ("token_access_type", "offline"),
            ],
        ),
        Provider::GoogleDrive => (
            GOOGLE_AUTH_URL,
            vec![
                ("client_id", client_id),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", GOOGLE_DRIVE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        ),
    };
    let query = serde_urlencoded::to_string(&params)
        .map_err(|e| StowageError::Config(format!("cannot encode authorization url: {e}")))?;
    Ok(format!("{base}?{query}"))
}
