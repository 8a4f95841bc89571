//! Provider-specific redirect URI selection.
//!
//! Google Drive delivers its result in-process to the opener. Dropbox only
//! accepts the exact redirect URI registered for the app, so it never varies
//! with the serving origin.

use std::collections::HashMap;
use stowage_config::RedirectSetting;
use stowage_types::Provider;
use url::Url;

/// Sentinel redirect meaning "deliver the result in-process to the opener".
pub const IN_PROCESS_REDIRECT: &str = "postmessage";

/// The registered Dropbox redirect, independent of the serving origin.
pub const DROPBOX_REDIRECT_URI: &str = "http://localhost:3000/oauth/dropbox/callback";

/// Path of the callback page for `provider`.
#[must_use]
pub fn callback_path(provider: Provider) -> String {
    format!("/oauth/{provider}/callback")
}

/// Resolves the redirect URI for each provider, with optional per-provider
/// overrides from configuration.
#[derive(Debug, Clone, Default)]
pub struct RedirectPolicy {
    overrides: HashMap<Provider, RedirectSetting>,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(overrides: HashMap<Provider, RedirectSetting>) -> Self {
        Self { overrides }
    }

    /// The effective setting for `provider`.
    #[must_use]
    pub fn setting(&self, provider: Provider) -> RedirectSetting {
        if let Some(s) = self.overrides.get(&provider) {
            return s.clone();
        }
        match provider {
            Provider::GoogleDrive => RedirectSetting::InProcess,
            Provider::Dropbox => RedirectSetting::Fixed(DROPBOX_REDIRECT_URI.to_string()),
        }
    }

    /// Whether `provider` hands its result to the opener without a callback page.
    #[must_use]
    pub fn is_in_process(&self, provider: Provider) -> bool {
        self.setting(provider) == RedirectSetting::InProcess
    }

    /// The redirect URI to embed in the authorization URL and to echo in the
    /// token exchange. `origin` is the origin the app is served from.
    #[must_use]
    pub fn redirect_uri(&self, provider: Provider, origin: &str) -> String {
        match self.setting(provider) {
            RedirectSetting::InProcess => IN_PROCESS_REDIRECT.to_string(),
            RedirectSetting::Fixed(url) => url,
            RedirectSetting::Origin => {
                format!("{}{}", origin.trim_end_matches('/'), callback_path(provider))
            }
        }
    }

    /// The origin the callback page for `provider` is actually served from,
    /// in its serialized form (lowercase, default port omitted).
    ///
    /// For a fixed redirect this is the registered URL's origin, which may
    /// differ from the origin the user is browsing.
    #[must_use]
    pub fn callback_origin(&self, provider: Provider, origin: &str) -> String {
        let page = match self.setting(provider) {
            RedirectSetting::Fixed(url) => origin_of(&url),
            RedirectSetting::InProcess | RedirectSetting::Origin => None,
        };
        page.or_else(|| origin_of(origin))
            .unwrap_or_else(|| origin.trim_end_matches('/').to_string())
    }
}

/// Serialized origin (`scheme://host[:port]`) of an absolute URL.
///
/// `None` for relative input and for URLs without a tuple origin.
#[must_use]
pub fn origin_of(url: &str) -> Option<String> {
    let origin = Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Whether `a` and `b` denote the same origin. Unparseable input never
/// matches.
#[must_use]
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin().is_tuple() && a.origin() == b.origin(),
        _ => false,
    }
}
